//! Rich-text and plain-text rendering for notifications.
//!
//! Rich text is HTML restricted to a small emphasis/code vocabulary. Exactly
//! three characters are escaped (`&`, `<`, `>`). Plain text is derived from the
//! markup alone: line-break tags become newlines, every other tag is stripped,
//! and the three entities are unescaped.

use std::sync::LazyLock;

use regex::Regex;

/// Tags that survive `to_rich_text`.
pub const RICH_TEXT_TAGS: [&str; 9] = ["b", "strong", "i", "em", "u", "s", "code", "pre", "br"];

static SIMPLE_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<\s*(/?)\s*([A-Za-z]+)\s*(/?)\s*>").expect("simple tag pattern compiles")
});
static LINE_BREAK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<\s*br\s*/?\s*>").expect("line break pattern compiles"));
static ANY_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<>]*>").expect("tag pattern compiles"));

/// A vocabulary tag as it affects nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum VocabularyTag {
    Open(String),
    Close(String),
    LineBreak,
}

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Inverse of [`escape_html`]; `&amp;` is decoded last so `&amp;lt;` stays `&lt;`.
pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn classify_tag(captures: &regex::Captures<'_>) -> Option<VocabularyTag> {
    let name = captures.get(2)?.as_str().to_ascii_lowercase();
    if !RICH_TEXT_TAGS.contains(&name.as_str()) {
        return None;
    }
    let closing = captures.get(1).is_some_and(|slash| !slash.as_str().is_empty());
    let self_closing = captures.get(3).is_some_and(|slash| !slash.as_str().is_empty());
    let line_break = name == "br";
    match (line_break, closing, self_closing) {
        (true, false, _) => Some(VocabularyTag::LineBreak),
        (false, false, false) => Some(VocabularyTag::Open(name)),
        (false, true, false) => Some(VocabularyTag::Close(name)),
        _ => None,
    }
}

/// Classifies one complete `<...>` token; `None` for anything outside the vocabulary.
pub(crate) fn parse_vocabulary_tag(token: &str) -> Option<VocabularyTag> {
    let captures = SIMPLE_TAG.captures(token)?;
    if captures.get(0)?.as_str().len() != token.len() {
        return None;
    }
    classify_tag(&captures)
}

pub(crate) fn push_open_tag(output: &mut String, name: &str) {
    output.push('<');
    output.push_str(name);
    output.push('>');
}

pub(crate) fn push_close_tag(output: &mut String, name: &str) {
    output.push_str("</");
    output.push_str(name);
    output.push('>');
}

/// Escapes `input` for the rich channel, keeping tags from [`RICH_TEXT_TAGS`].
///
/// The result is always balanced: a closing tag with no matching open tag is
/// escaped, tags closed out of order are closed innermost first, and tags
/// still open at the end are closed.
pub fn to_rich_text(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut open: Vec<String> = Vec::new();
    let mut cursor = 0usize;
    for captures in SIMPLE_TAG.captures_iter(input) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        output.push_str(&escape_html(&input[cursor..whole.start()]));
        cursor = whole.end();
        match classify_tag(&captures) {
            Some(VocabularyTag::LineBreak) => output.push_str(whole.as_str()),
            Some(VocabularyTag::Open(name)) => {
                push_open_tag(&mut output, &name);
                open.push(name);
            }
            Some(VocabularyTag::Close(name)) if open.contains(&name) => {
                while let Some(inner) = open.pop() {
                    push_close_tag(&mut output, &inner);
                    if inner == name {
                        break;
                    }
                }
            }
            _ => output.push_str(&escape_html(whole.as_str())),
        }
    }
    output.push_str(&escape_html(&input[cursor..]));
    while let Some(name) = open.pop() {
        push_close_tag(&mut output, &name);
    }
    output
}

/// Derives plain text from rich markup. Total: any input yields a string, and
/// text with no tags or entities comes back unchanged apart from trimming.
pub fn to_plain_text(markup: &str) -> String {
    let with_newlines = LINE_BREAK_TAG.replace_all(markup, "\n");
    let stripped = ANY_TAG.replace_all(&with_newlines, "");
    unescape_html(&stripped).trim().to_string()
}

/// Rewrites line-break tags as newlines; the chat API's HTML mode has no `br`.
pub fn to_chat_markup(markup: &str) -> String {
    LINE_BREAK_TAG.replace_all(markup, "\n").into_owned()
}

/// Builder for rich-text bodies using only the permitted vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichText {
    markup: String,
}

impl RichText {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: &str) -> Self {
        self.markup.push_str(&escape_html(text));
        self
    }

    /// Appends caller markup after sanitizing it with [`to_rich_text`].
    pub fn markup(mut self, fragment: &str) -> Self {
        self.markup.push_str(&to_rich_text(fragment));
        self
    }

    pub fn bold(self, text: &str) -> Self {
        self.wrap("b", text)
    }

    pub fn italic(self, text: &str) -> Self {
        self.wrap("i", text)
    }

    pub fn underline(self, text: &str) -> Self {
        self.wrap("u", text)
    }

    pub fn code(self, text: &str) -> Self {
        self.wrap("code", text)
    }

    pub fn pre(self, text: &str) -> Self {
        self.wrap("pre", text)
    }

    pub fn line_break(mut self) -> Self {
        self.markup.push_str("<br/>");
        self
    }

    fn wrap(mut self, tag: &str, text: &str) -> Self {
        self.markup.push('<');
        self.markup.push_str(tag);
        self.markup.push('>');
        self.markup.push_str(&escape_html(text));
        self.markup.push_str("</");
        self.markup.push_str(tag);
        self.markup.push('>');
        self
    }

    pub fn is_empty(&self) -> bool {
        self.markup.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.markup
    }

    pub fn into_string(self) -> String {
        self.markup
    }
}

impl std::fmt::Display for RichText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.markup)
    }
}

#[cfg(test)]
mod tests {
    use super::{escape_html, to_chat_markup, to_plain_text, to_rich_text, unescape_html, RichText};

    #[test]
    fn unit_escape_touches_exactly_three_characters() {
        assert_eq!(
            escape_html(r#"a & b < c > d "quoted" 'single'"#),
            r#"a &amp; b &lt; c &gt; d "quoted" 'single'"#
        );
        assert_eq!(unescape_html("&amp;lt;"), "&lt;");
    }

    #[test]
    fn functional_rich_then_plain_round_trips_reference_sentence() {
        let rich = to_rich_text("a <b>bold</b> & line<br/>break");
        assert_eq!(rich, "a <b>bold</b> &amp; line<br/>break");
        assert_eq!(to_plain_text(&rich), "a bold & line\nbreak");
    }

    #[test]
    fn unit_rich_text_escapes_tags_outside_vocabulary() {
        let rich = to_rich_text(r#"<script>alert(1)</script> <a href="x">link</a> <i>ok</i>"#);
        assert_eq!(
            rich,
            r#"&lt;script&gt;alert(1)&lt;/script&gt; &lt;a href="x"&gt;link&lt;/a&gt; <i>ok</i>"#
        );
        assert_eq!(
            to_plain_text(&rich),
            r#"<script>alert(1)</script> <a href="x">link</a> ok"#
        );
    }

    #[test]
    fn regression_rich_text_closes_tags_left_open() {
        assert_eq!(
            to_rich_text("meeting at 10 <b>tomorrow"),
            "meeting at 10 <b>tomorrow</b>"
        );
        assert_eq!(to_rich_text("<b><i>both"), "<b><i>both</i></b>");
        assert_eq!(to_rich_text("<B>loud</B>"), "<b>loud</b>");
    }

    #[test]
    fn regression_rich_text_escapes_unmatched_closing_tags() {
        assert_eq!(to_rich_text("done</b> early"), "done&lt;/b&gt; early");
        assert_eq!(to_rich_text("a</br>b<b/>"), "a&lt;/br&gt;b&lt;b/&gt;");
        assert_eq!(
            to_rich_text("<b>x<i>y</b>z</i>"),
            "<b>x<i>y</i></b>z&lt;/i&gt;"
        );
    }

    #[test]
    fn unit_plain_text_handles_line_break_variants_and_stray_brackets() {
        assert_eq!(to_plain_text("one<br>two<BR />three"), "one\ntwo\nthree");
        assert_eq!(to_plain_text("  2 < 3 is true  "), "2 < 3 is true");
        assert_eq!(to_plain_text("<b>unterminated"), "unterminated");
        assert_eq!(to_plain_text(""), "");
    }

    #[test]
    fn unit_plain_text_is_idempotent_on_plain_input() {
        let once = to_plain_text("<b>Booking</b> confirmed<br/>10:00 &amp; 11:00");
        assert_eq!(once, "Booking confirmed\n10:00 & 11:00");
        assert_eq!(to_plain_text(&once), once);
        assert_eq!(to_plain_text("  already plain  "), "already plain");
    }

    #[test]
    fn unit_builder_composes_permitted_vocabulary() {
        let body = RichText::new()
            .bold("Query failed")
            .line_break()
            .text("error: a<b & c")
            .line_break()
            .code("exit 1")
            .markup(" <u>see</u> <blink>log</blink>");
        assert_eq!(
            body.as_str(),
            "<b>Query failed</b><br/>error: a&lt;b &amp; c<br/><code>exit 1</code> <u>see</u> &lt;blink&gt;log&lt;/blink&gt;"
        );
        assert_eq!(
            to_plain_text(body.as_str()),
            "Query failed\nerror: a<b & c\nexit 1 see <blink>log</blink>"
        );
    }

    #[test]
    fn unit_chat_markup_converts_breaks_and_keeps_emphasis() {
        assert_eq!(to_chat_markup("<b>t</b><br/>x<br>y"), "<b>t</b>\nx\ny");
    }
}
