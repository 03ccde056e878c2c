//! Outbound address handling applied to the encoded copy of a message

use courier_core::{Address, Error, Result};
use courier_fabric::{Message, Transform};

/// Expand a `~` reply-to into an address pointing back at this messenger
pub fn munge_reply_to(name: &str, msg: &mut Message) {
    let expanded = match msg.reply_to() {
        Some("~") => format!("amqp://{}", name),
        Some(reply_to) => match reply_to.strip_prefix("~/") {
            Some(rest) => format!("amqp://{}/{}", name, rest),
            None => return,
        },
        None => return,
    };
    msg.set_reply_to(Some(expanded));
}

/// Address a message should carry on the wire
///
/// The first matching rewrite rule wins. Without a match, credentials are
/// stripped so they never travel inside the message.
pub fn rewrite<T: Transform>(rules: &T, address: &str) -> Result<String> {
    let rewritten = rules
        .apply(address)
        .map_err(|e| Error::generic(format!("rewrite error: {}", e)))?;
    match rewritten {
        Some(rewritten) => Ok(rewritten),
        None => Ok(strip_credentials(address)),
    }
}

fn strip_credentials(address: &str) -> String {
    if !address.contains('@') {
        return address.to_string();
    }
    match Address::parse(address) {
        Ok(parsed) if parsed.user.is_some() || parsed.pass.is_some() => {
            parsed.without_credentials()
        }
        _ => address.to_string(),
    }
}
