//! Non-ASCII slash commands become action lines: `/拍 hard` replying to Bob
//! turns into "Alice 拍 Bob hard".

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::types::{Message, MessageKind, MessageOrigin, User};
use teloxide::utils::html;
use tracing::debug;

use crate::config::{ConfigError, Entry};
use crate::plugin::{BotContext, Plugin};

/// Factory for `megaphone`. Takes no options.
pub fn build(_entry: &Entry) -> Result<Arc<dyn Plugin>, ConfigError> {
    Ok(Arc::new(Megaphone))
}

pub struct Megaphone;

fn user_link(user: &User) -> String {
    format!("<a href=\"tg://user?id={}\">{}</a>", user.id, html::escape(&user.full_name()))
}

/// Split `/verb rest` where the verb is not plain ASCII.
pub fn parse_action(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    let (head, rest) = text.split_once(' ').unwrap_or((text, ""));
    let verb = head.strip_prefix('/')?;
    if verb.is_empty() || verb.is_ascii() {
        return None;
    }
    Some((verb, rest.trim()))
}

/// Who the action is done to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target<'a> {
    User(&'a User),
    /// A sender known only by name, e.g. one who hides their account.
    Named(&'a str),
}

/// Sender of the replied message, in this chat or quoted from another one.
pub fn reply_target(msg: &Message) -> Option<Target<'_>> {
    if let Some(reply) = msg.reply_to_message() {
        return reply.from.as_ref().map(Target::User);
    }
    let MessageKind::Common(common) = &msg.kind else {
        return None;
    };
    match &common.external_reply.as_ref()?.origin {
        MessageOrigin::User { sender_user, .. } => Some(Target::User(sender_user)),
        MessageOrigin::HiddenUser { sender_user_name, .. } => Some(Target::Named(sender_user_name)),
        _ => None,
    }
}

/// The HTML action line. Without a target, or when the target is the sender,
/// the object is "themselves", which is dropped when there is no `rest`.
pub fn action_line(sender: &User, verb: &str, target: Option<Target<'_>>, rest: &str) -> String {
    let object = match target {
        Some(Target::User(target)) if target.id != sender.id => user_link(target),
        Some(Target::Named(name)) => html::escape(name),
        _ if rest.is_empty() => String::new(),
        _ => "themselves".to_string(),
    };

    [user_link(sender), html::escape(verb), object, html::escape(rest)]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl Plugin for Megaphone {
    fn name(&self) -> &str {
        "megaphone"
    }

    async fn on_message(&self, ctx: &BotContext, msg: &Message) {
        if msg.via_bot.is_some() {
            return;
        }
        let (Some(text), Some(sender)) = (msg.text(), msg.from.as_ref()) else {
            return;
        };
        let Some((verb, rest)) = parse_action(text) else {
            return;
        };

        let line = action_line(sender, verb, reply_target(msg), rest);
        debug!("megaphone: {}", line);

        let chat_id = msg.chat.id.0;
        let (_, _) = tokio::join!(
            ctx.telegram.delete_message(chat_id, msg.id.0 as i64),
            ctx.telegram.send_html(chat_id, &line, None),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: u64, name: &str) -> User {
        serde_json::from_value(json!({"id": id, "is_bot": false, "first_name": name})).unwrap()
    }

    #[test]
    fn test_parse_action() {
        assert_eq!(parse_action("/拍 hard"), Some(("拍", "hard")));
        assert_eq!(parse_action(" /抱抱 "), Some(("抱抱", "")));
        assert_eq!(parse_action("/start"), None);
        assert_eq!(parse_action("hello"), None);
        assert_eq!(parse_action("/"), None);
    }

    #[test]
    fn test_reply_to_other_user() {
        let alice = user(1, "Alice");
        let bob = user(2, "Bob");
        assert_eq!(
            action_line(&alice, "拍", Some(Target::User(&bob)), "hard"),
            "<a href=\"tg://user?id=1\">Alice</a> 拍 <a href=\"tg://user?id=2\">Bob</a> hard"
        );
    }

    #[test]
    fn test_no_target_with_rest() {
        let alice = user(1, "Alice");
        assert_eq!(
            action_line(&alice, "拍", None, "the table"),
            "<a href=\"tg://user?id=1\">Alice</a> 拍 themselves the table"
        );
    }

    #[test]
    fn test_no_target_no_rest_drops_object() {
        let alice = user(1, "Alice");
        assert_eq!(action_line(&alice, "睡了", None, ""), "<a href=\"tg://user?id=1\">Alice</a> 睡了");
    }

    #[test]
    fn test_reply_to_self_no_rest() {
        let alice = user(1, "Alice");
        assert_eq!(action_line(&alice, "睡了", Some(Target::User(&alice)), ""), "<a href=\"tg://user?id=1\">Alice</a> 睡了");
    }

    #[test]
    fn test_reply_to_other_without_rest_keeps_target() {
        let alice = user(1, "Alice");
        let bob = user(2, "Bob");
        assert!(action_line(&alice, "拍", Some(Target::User(&bob)), "").ends_with("拍 <a href=\"tg://user?id=2\">Bob</a>"));
    }

    fn action_message(extra: serde_json::Value) -> Message {
        let mut value = json!({
            "message_id": 5,
            "date": 1_700_000_000,
            "chat": {"id": -1001, "type": "supergroup", "title": "Test"},
            "from": {"id": 1, "is_bot": false, "first_name": "Alice"},
            "text": "/拍",
        });
        if let (Some(value), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            value.extend(extra.clone());
        }
        serde_json::from_value(value).unwrap()
    }

    fn quoted_photo(origin: serde_json::Value) -> serde_json::Value {
        json!({
            "origin": origin,
            "message_id": 77,
            "photo": [{"file_id": "p", "file_unique_id": "u", "width": 90, "height": 90}]
        })
    }

    #[test]
    fn test_target_from_reply() {
        let msg = action_message(json!({"reply_to_message": {
            "message_id": 4,
            "date": 1_700_000_000,
            "chat": {"id": -1001, "type": "supergroup", "title": "Test"},
            "from": {"id": 2, "is_bot": false, "first_name": "Bob"},
            "text": "hi"
        }}));
        match reply_target(&msg) {
            Some(Target::User(user)) => assert_eq!(user.first_name, "Bob"),
            other => panic!("expected Bob, got {other:?}"),
        }
        assert_eq!(reply_target(&action_message(json!({}))), None);
    }

    #[test]
    fn test_target_from_quote_in_other_chat() {
        let msg = action_message(json!({"external_reply": quoted_photo(json!({
            "type": "user",
            "date": 1_700_000_000,
            "sender_user": {"id": 2, "is_bot": false, "first_name": "Bob"}
        }))}));
        let alice = user(1, "Alice");
        assert_eq!(
            action_line(&alice, "拍", reply_target(&msg), ""),
            "<a href=\"tg://user?id=1\">Alice</a> 拍 <a href=\"tg://user?id=2\">Bob</a>"
        );
    }

    #[test]
    fn test_hidden_sender_is_named() {
        let msg = action_message(json!({"external_reply": quoted_photo(json!({
            "type": "hidden_user",
            "date": 1_700_000_000,
            "sender_user_name": "Carol <3"
        }))}));
        assert_eq!(reply_target(&msg), Some(Target::Named("Carol <3")));

        let alice = user(1, "Alice");
        assert_eq!(
            action_line(&alice, "抱抱", reply_target(&msg), "tight"),
            "<a href=\"tg://user?id=1\">Alice</a> 抱抱 Carol &lt;3 tight"
        );
    }

    #[test]
    fn test_names_are_escaped() {
        let eve = user(3, "<Eve>");
        assert!(action_line(&eve, "拍", None, "a&b").contains("&lt;Eve&gt;"));
        assert!(action_line(&eve, "拍", None, "a&b").ends_with("a&amp;b"));
    }
}
