use std::error::Error as StdError;
use std::io;

use crate::model::ErrorKind;

/// Map a transport failure onto the error taxonomy, with the full cause
/// chain as detail.
pub fn classify(error: &reqwest::Error) -> (ErrorKind, String) {
    let detail = chain_text(error);

    if error.is_timeout() {
        let kind = if error.is_connect() { ErrorKind::ConnectTimeout } else { ErrorKind::Timeout };
        return (kind, detail);
    }

    let mut source: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(cause) = source {
        if let Some(kind) = cause.downcast_ref::<io::Error>().and_then(classify_io) {
            return (kind, detail);
        }
        source = cause.source();
    }

    if let Some(kind) = classify_message(&detail) {
        return (kind, detail);
    }

    (ErrorKind::Transport, detail)
}

/// Socket-level causes. `None` when the kind carries no useful signal and
/// the message should decide instead.
pub fn classify_io(error: &io::Error) -> Option<ErrorKind> {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
        io::ErrorKind::TimedOut => Some(ErrorKind::ConnectTimeout),
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
            Some(ErrorKind::HostUnreachable)
        }
        io::ErrorKind::ConnectionReset => Some(ErrorKind::Unknown("ECONNRESET".into())),
        io::ErrorKind::ConnectionAborted => Some(ErrorKind::Unknown("ECONNABORTED".into())),
        io::ErrorKind::BrokenPipe => Some(ErrorKind::Unknown("EPIPE".into())),
        io::ErrorKind::AddrNotAvailable => Some(ErrorKind::Unknown("EADDRNOTAVAIL".into())),
        _ => None,
    }
}

/// Fallback on the rendered cause chain, for resolvers and TLS stacks that
/// do not surface a typed error.
pub fn classify_message(message: &str) -> Option<ErrorKind> {
    let message = message.to_ascii_lowercase();

    if ["dns error", "failed to lookup address", "name or service not known", "no such host"]
        .iter()
        .any(|needle| message.contains(needle))
    {
        return Some(ErrorKind::DnsNotFound);
    }
    if message.contains("connection refused") {
        return Some(ErrorKind::ConnectionRefused);
    }
    if ["certificate", "tls", "ssl", "handshake"].iter().any(|needle| message.contains(needle)) {
        return Some(ErrorKind::Tls);
    }
    if message.contains("unreachable") {
        return Some(ErrorKind::HostUnreachable);
    }
    None
}

fn chain_text(error: &(dyn StdError + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let rendered = cause.to_string();
        if !text.contains(&rendered) {
            text.push_str(": ");
            text.push_str(&rendered);
        }
        source = cause.source();
    }
    text
}
