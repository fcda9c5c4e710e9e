use serde::{Deserialize, Serialize};

const CONNECTION_REFUSED: &str = "error: couldn't connect to server";
const LEGACY_ERROR_PREFIX: &str = "error:";
const CODED_ERROR_PREFIX: &str = "error code:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Unavailable,
    Error,
    Success,
}

pub fn classify(raw: &str) -> ReplyKind {
    let text = raw.trim();
    if starts_with_ignore_case(text, CONNECTION_REFUSED) {
        ReplyKind::Unavailable
    } else if starts_with_ignore_case(text, LEGACY_ERROR_PREFIX)
        || starts_with_ignore_case(text, CODED_ERROR_PREFIX)
    {
        ReplyKind::Error
    } else {
        ReplyKind::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DaemonErrorReply {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Turns either error shape into `{code, message}`.
///
/// Older daemons print `error: {"code":-15,"message":"..."}`; newer ones print
///
/// ```text
/// error code: -28
/// error message:
/// Loading block index...
/// ```
pub fn parse_error_reply(raw: &str) -> Option<DaemonErrorReply> {
    let text = raw.trim();
    if starts_with_ignore_case(text, CODED_ERROR_PREFIX) {
        let mut lines = text.lines();
        let code = lines
            .next()?
            .get(CODED_ERROR_PREFIX.len()..)?
            .trim()
            .parse::<i64>()
            .ok()?;
        // "error message:" header
        lines.next();
        let message = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        return Some(DaemonErrorReply { code, message });
    }
    if starts_with_ignore_case(text, LEGACY_ERROR_PREFIX) {
        let json = &text[text.find('{')?..];
        return serde_json::from_str(json).ok();
    }
    None
}

fn starts_with_ignore_case(text: &str, prefix: &str) -> bool {
    text.get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
