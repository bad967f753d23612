//! Render model replies, which are mostly Markdown, as Telegram HTML.

use pulldown_cmark::{CodeBlockKind, Event, Options, Parser, Tag, TagEnd};
use teloxide::utils::html;

fn attribute(value: &str) -> String {
    html::escape(value).replace('"', "&quot;")
}

fn start_line(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

/// Convert Markdown to the tag subset Telegram accepts. Headings become bold
/// lines, list items get bullets or numbers, raw HTML is shown escaped.
pub fn to_telegram_html(markdown: &str) -> String {
    let mut out = String::new();
    // Next number of each open list; `None` for bullet lists.
    let mut lists: Vec<Option<u64>> = Vec::new();

    for event in Parser::new_ext(markdown, Options::ENABLE_STRIKETHROUGH) {
        match event {
            Event::Start(tag) => match tag {
                Tag::Heading { .. } | Tag::Strong => out.push_str("<b>"),
                Tag::Emphasis => out.push_str("<i>"),
                Tag::Strikethrough => out.push_str("<s>"),
                Tag::CodeBlock(CodeBlockKind::Fenced(lang)) if !lang.is_empty() => {
                    let lang = lang.split_whitespace().next().unwrap_or_default();
                    out.push_str(&format!("<pre><code class=\"language-{}\">", attribute(lang)));
                }
                Tag::CodeBlock(_) => out.push_str("<pre><code>"),
                Tag::Link { dest_url, .. } | Tag::Image { dest_url, .. } => {
                    out.push_str(&format!("<a href=\"{}\">", attribute(&dest_url)));
                }
                Tag::List(start) => {
                    start_line(&mut out);
                    lists.push(start);
                }
                Tag::Item => {
                    start_line(&mut out);
                    out.push_str(&"  ".repeat(lists.len().saturating_sub(1)));
                    match lists.last_mut() {
                        Some(Some(n)) => {
                            out.push_str(&format!("{n}. "));
                            *n += 1;
                        }
                        _ => out.push_str("• "),
                    }
                }
                _ => {}
            },
            Event::End(tag) => match tag {
                TagEnd::Paragraph => out.push_str(if lists.is_empty() { "\n\n" } else { "\n" }),
                TagEnd::Heading(_) => out.push_str("</b>\n\n"),
                TagEnd::Strong => out.push_str("</b>"),
                TagEnd::Emphasis => out.push_str("</i>"),
                TagEnd::Strikethrough => out.push_str("</s>"),
                TagEnd::CodeBlock => out.push_str("</code></pre>\n\n"),
                TagEnd::Link | TagEnd::Image => out.push_str("</a>"),
                TagEnd::Item => start_line(&mut out),
                TagEnd::List(_) => {
                    lists.pop();
                    if lists.is_empty() {
                        out.push('\n');
                    }
                }
                _ => {}
            },
            Event::Text(text) => out.push_str(&html::escape(&text)),
            Event::Code(code) => out.push_str(&format!("<code>{}</code>", html::escape(&code))),
            Event::Html(raw) | Event::InlineHtml(raw) => out.push_str(&html::escape(&raw)),
            Event::SoftBreak | Event::HardBreak => out.push('\n'),
            Event::Rule => {
                start_line(&mut out);
                out.push_str("——————\n\n");
            }
            _ => {}
        }
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_styles() {
        assert_eq!(
            to_telegram_html("**bold** and *it* and ~~gone~~ and `a<b`"),
            "<b>bold</b> and <i>it</i> and <s>gone</s> and <code>a&lt;b</code>"
        );
    }

    #[test]
    fn test_plain_text_is_escaped() {
        assert_eq!(to_telegram_html("1 < 2 & 3 > 2"), "1 &lt; 2 &amp; 3 &gt; 2");
        assert_eq!(to_telegram_html("<script>x</script>"), "&lt;script&gt;x&lt;/script&gt;");
    }

    #[test]
    fn test_fenced_code_keeps_language() {
        let html = to_telegram_html("Run:\n\n```rust\nfn main() { a < b }\n```\n");
        assert_eq!(html, "Run:\n\n<pre><code class=\"language-rust\">fn main() { a &lt; b }\n</code></pre>");
    }

    #[test]
    fn test_heading_and_paragraphs() {
        assert_eq!(to_telegram_html("# Title\n\nfirst\n\nsecond"), "<b>Title</b>\n\nfirst\n\nsecond");
    }

    #[test]
    fn test_lists() {
        assert_eq!(to_telegram_html("- one\n- two"), "• one\n• two");
        assert_eq!(to_telegram_html("3. a\n4. b"), "3. a\n4. b");
        assert_eq!(to_telegram_html("- outer\n  - inner"), "• outer\n  • inner");
    }

    #[test]
    fn test_link_href_is_quoted() {
        assert_eq!(
            to_telegram_html("[docs](https://example.org/?q=\"x\"&y=1)"),
            "<a href=\"https://example.org/?q=&quot;x&quot;&amp;y=1\">docs</a>"
        );
    }
}
