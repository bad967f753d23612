use relaybot::memory::{ConversationMemory, thread_id};
use relaybot::relay::Turn;

const CHAT: i64 = -100555;

/// A relay answering three threads with room for two.
#[test]
fn test_oldest_thread_forgotten_after_capacity() {
    let mut memory: ConversationMemory<Vec<Turn>> = ConversationMemory::new(2);

    for (reply_id, prompt) in [(10, "first"), (20, "second")] {
        memory.remember(&thread_id(CHAT, reply_id), vec![Turn::user(prompt), Turn::assistant("ok")]);
    }
    assert!(memory.recall(&thread_id(CHAT, 10)).is_some());

    // Continuing thread 10 under the same key keeps its slot
    let mut continued = memory.recall(&thread_id(CHAT, 10)).unwrap();
    continued.push(Turn::user("more"));
    memory.remember(&thread_id(CHAT, 10), continued);
    assert_eq!(memory.len(), 2);

    memory.remember(&thread_id(CHAT, 30), vec![Turn::user("third")]);
    assert!(memory.recall(&thread_id(CHAT, 10)).is_none());
    assert_eq!(memory.recall(&thread_id(CHAT, 20)).map(|t| t.len()), Some(2));
    assert_eq!(memory.recall(&thread_id(CHAT, 30)).map(|t| t.len()), Some(1));
}

#[test]
fn test_replies_in_other_chats_are_separate_threads() {
    let mut memory: ConversationMemory<Vec<Turn>> = ConversationMemory::new(10);
    memory.remember(&thread_id(CHAT, 1), vec![Turn::user("here")]);
    assert!(memory.recall(&thread_id(CHAT - 1, 1)).is_none());
    assert!(memory.recall(&thread_id(CHAT, 1)).is_some());
}
