//! Rewrites inline `<...>` entity references into readable text.
//!
//! Slack encodes mentions and links as `<#C123>`, `<@U123>`, `<!here>` and
//! `<https://...>`. Channel and user ids are resolved against the local
//! workspace state; anything unknown is left as its raw token.

use {regex::Regex, tracing::error};

/// Maximum size of a decoded message, in bytes. Output past this point is
/// dropped (cut on a char boundary) rather than reported as an error.
pub const MESSAGE_MAX_LENGTH: usize = 4096;

/// Non-greedy: `<a> and <b>` yields two matches, not one.
const ENTITY_PATTERN: &str = "<(.*?)>";

/// Lookups the decoder needs from the workspace model.
pub trait EntityResolver {
    fn channel_name(&self, id: &str) -> Option<&str>;
    fn user_display_name(&self, id: &str) -> Option<&str>;
}

/// Entity decoder. Cheap to share; holds only the compiled pattern.
#[derive(Debug, Clone)]
pub struct TextDecoder {
    entity: Option<Regex>,
    capacity: usize,
}

impl Default for TextDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl TextDecoder {
    pub fn new() -> Self {
        Self::with_pattern(ENTITY_PATTERN, MESSAGE_MAX_LENGTH)
    }

    /// Build a decoder from an explicit entity grammar. A pattern that fails
    /// to compile yields a decoder that returns its input unchanged.
    pub fn with_pattern(pattern: &str, capacity: usize) -> Self {
        let entity = match Regex::new(pattern) {
            Ok(re) => Some(re),
            Err(e) => {
                error!(error = %e, "error compiling message formatting pattern");
                None
            },
        };
        Self { entity, capacity }
    }

    pub fn decode(&self, text: &str, resolver: &dyn EntityResolver) -> String {
        let Some(entity) = &self.entity else {
            return text.to_string();
        };

        let mut out = BoundedBuffer::new(self.capacity);
        let mut cursor = 0;

        for caps in entity.captures_iter(text) {
            let (Some(whole), Some(code)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push(&text[cursor..whole.start()]);
            out.push(&translate_code(code.as_str(), resolver));
            cursor = whole.end();
        }
        out.push(&text[cursor..]);

        out.into_string()
    }
}

/// Translate one entity body (the text between the angle brackets).
fn translate_code(code: &str, resolver: &dyn EntityResolver) -> String {
    match code.chars().next() {
        Some('#') => resolver
            .channel_name(&code[1..])
            .map_or_else(|| code.to_string(), str::to_string),
        Some('@') => resolver
            .user_display_name(&code[1..])
            .map_or_else(|| code.to_string(), str::to_string),
        Some('!') => format!("@{}", &code[1..]),
        _ => code.to_string(),
    }
}

/// Append-only string with a hard byte capacity.
struct BoundedBuffer {
    buf: String,
    capacity: usize,
}

impl BoundedBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            buf: String::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn push(&mut self, s: &str) {
        let room = self.capacity.saturating_sub(self.buf.len());
        if s.len() <= room {
            self.buf.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.buf.push_str(&s[..cut]);
    }

    fn into_string(self) -> String {
        self.buf
    }
}
