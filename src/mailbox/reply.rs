//! Reply composition: subject, recipients and quoted thread body.
//!
//! Pure string handling; the protocol adapter only ships the result.

use std::collections::HashSet;

use super::types::{Address, Message};

/// A reply ready to be stored as a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDraft {
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub subject: String,
    pub body: String,
    pub in_reply_to: Vec<String>,
    pub references: Vec<String>,
}

/// Prefix `Re:` unless already present.
pub fn reply_subject(subject: &str) -> String {
    let cleaned = subject.trim();
    if cleaned.to_lowercase().starts_with("re:") {
        cleaned.to_string()
    } else if cleaned.is_empty() {
        "Re:".to_string()
    } else {
        format!("Re: {cleaned}")
    }
}

/// Prefix every line with `> `.
pub fn quote_lines(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    text.lines()
        .map(|line| format!("> {line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build a reply to `original`, quoting its body.
///
/// With `reply_all`, the original To/Cc (minus the sender and `own_addresses`)
/// are copied to Cc.
pub fn compose_reply(
    original: &Message,
    reply_content: &str,
    reply_all: bool,
    own_addresses: &HashSet<String>,
) -> Option<ReplyDraft> {
    let sender = original.from.clone().filter(|a| !a.email.trim().is_empty())?;

    let mut cc = Vec::new();
    if reply_all {
        let mut seen: HashSet<String> = own_addresses.clone();
        seen.insert(sender.normalized());
        for person in original.to.iter().chain(original.cc.iter()) {
            let addr = person.normalized();
            if addr.is_empty() || !seen.insert(addr) {
                continue;
            }
            cc.push(person.clone());
        }
    }

    let date = original
        .received_at
        .map(|d| d.to_rfc3339())
        .unwrap_or_default();
    let body = format!(
        "{reply_content}\n\nOn {date}, {} wrote:\n\n{}",
        sender.display(),
        quote_lines(original.text())
    );

    let in_reply_to = original.message_id.clone();
    let mut references = original.references.clone();
    for id in &in_reply_to {
        if !references.contains(id) {
            references.push(id.clone());
        }
    }

    Some(ReplyDraft {
        to: vec![sender],
        cc,
        subject: reply_subject(&original.subject),
        body,
        in_reply_to,
        references,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn original() -> Message {
        Message {
            id: "m1".into(),
            subject: "Budget".into(),
            from: Some(Address::new("boss@example.com").with_name("Boss")),
            to: vec![Address::new("me@example.com"), Address::new("ann@example.com")],
            cc: vec![Address::new("Boss@example.com"), Address::new("bob@example.com")],
            body: "Can you review?\nThanks".into(),
            message_id: vec!["<abc@example.com>".into()],
            references: vec!["<root@example.com>".into()],
            ..Default::default()
        }
    }

    #[test]
    fn subject_prefix_not_doubled() {
        assert_eq!(reply_subject("Re: hi"), "Re: hi");
        assert_eq!(reply_subject("hi"), "Re: hi");
        assert_eq!(reply_subject("  "), "Re:");
    }

    #[test]
    fn reply_all_excludes_sender_and_self() {
        let own: HashSet<String> = ["me@example.com".to_string()].into_iter().collect();
        let draft = compose_reply(&original(), "Sure.", true, &own).unwrap();
        assert_eq!(draft.to[0].email, "boss@example.com");
        let cc: Vec<&str> = draft.cc.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(cc, vec!["ann@example.com", "bob@example.com"]);
    }

    #[test]
    fn reply_without_reply_all_has_no_cc() {
        let draft = compose_reply(&original(), "Sure.", false, &HashSet::new()).unwrap();
        assert!(draft.cc.is_empty());
    }

    #[test]
    fn body_quotes_original_thread() {
        let draft = compose_reply(&original(), "Sure.", true, &HashSet::new()).unwrap();
        assert!(draft.body.starts_with("Sure.\n\nOn "));
        assert!(draft.body.contains("Boss <boss@example.com> wrote:"));
        assert!(draft.body.contains("> Can you review?\n> Thanks"));
    }

    #[test]
    fn references_include_message_id() {
        let draft = compose_reply(&original(), "x", false, &HashSet::new()).unwrap();
        assert_eq!(draft.in_reply_to, vec!["<abc@example.com>".to_string()]);
        assert_eq!(
            draft.references,
            vec!["<root@example.com>".to_string(), "<abc@example.com>".to_string()]
        );
    }

    #[test]
    fn no_sender_means_no_reply() {
        let mut msg = original();
        msg.from = None;
        assert!(compose_reply(&msg, "x", true, &HashSet::new()).is_none());
    }
}
