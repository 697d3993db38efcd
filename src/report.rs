//! Rendering for the status surface: cycle summaries, sender lists and
//! list-management results. Everything returns a `String`; the binary
//! decides where it goes.

use std::fmt::Write as _;

use chrono::SecondsFormat;

use crate::store::{BlockedSender, ListChange, MessageOutcome, RunSummary, TriageStatus, VipSender};

/// One-line header plus the archived, drafted and auto-promoted lists.
pub fn render_summary(summary: &RunSummary) -> String {
    let mode = if summary.is_apply() { "APPLY" } else { "DRY-RUN" };
    let mut out = format!(
        "[{mode}] {} | seen={} triaged={} archived={} drafted={} skipped={} errors={}",
        summary.run_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        summary.emails_seen,
        summary.triaged_count,
        summary.archived_count,
        summary.drafted_count,
        summary.skipped_count,
        summary.error_count,
    );
    if summary.interrupted {
        out.push_str(" (interrupted)");
    }
    out.push('\n');

    let archived: Vec<&MessageOutcome> = summary.details.iter().filter(|m| m.archived).collect();
    push_section(&mut out, "Archived", &archived, |m| {
        format!("{} | {} | {}", m.email_id, m.sender, m.subject)
    });

    let drafted: Vec<&MessageOutcome> = summary
        .details
        .iter()
        .filter(|m| m.status == TriageStatus::Drafted)
        .collect();
    push_section(&mut out, "Drafted", &drafted, |m| {
        format!(
            "{} | draft={} | {}",
            m.email_id,
            m.draft_id.as_deref().unwrap_or("-"),
            m.subject
        )
    });

    let promoted: Vec<&MessageOutcome> = summary.details.iter().filter(|m| m.auto_vip).collect();
    push_section(&mut out, "Auto-promoted VIP senders", &promoted, |m| m.sender.clone());

    let failed: Vec<&MessageOutcome> = summary
        .details
        .iter()
        .filter(|m| m.status == TriageStatus::Error)
        .collect();
    push_section(&mut out, "Errors", &failed, |m| {
        format!("{} | {}", m.email_id, m.error.as_deref().unwrap_or("unknown error"))
    });

    out
}

fn push_section<F>(out: &mut String, title: &str, items: &[&MessageOutcome], line: F)
where
    F: Fn(&MessageOutcome) -> String,
{
    if items.is_empty() {
        return;
    }
    let _ = writeln!(out, "{title}:");
    for item in items {
        let _ = writeln!(out, "- {}", line(item));
    }
}

pub fn render_summary_json(summary: &RunSummary) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(summary)
}

/// Latest run, or a note that nothing has run yet.
pub fn render_status(latest: Option<&RunSummary>) -> String {
    match latest {
        Some(summary) => {
            let mut out = format!(
                "Last run #{} ({})\n",
                summary.id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                summary.mode
            );
            out.push_str(&render_summary(summary));
            out
        }
        None => "No runs recorded yet.\n".to_string(),
    }
}

pub fn render_vips(vips: &[VipSender]) -> String {
    if vips.is_empty() {
        return "No VIP senders.\n".to_string();
    }
    let mut out = format!("VIP senders ({}):\n", vips.len());
    for vip in vips {
        let _ = writeln!(out, "- {} [{}]", vip.address, vip.source.as_str());
    }
    out
}

pub fn render_blocked(blocked: &[BlockedSender]) -> String {
    if blocked.is_empty() {
        return "No draft-blocked senders.\n".to_string();
    }
    let mut out = format!("Draft-blocked senders ({}):\n", blocked.len());
    for sender in blocked {
        let _ = writeln!(out, "- {}", sender.address);
    }
    out
}

/// `list` is a label such as `VIP` or `draft-block`.
pub fn render_list_change(list: &str, address: &str, change: ListChange) -> String {
    match change {
        ListChange::Added => format!("{list}: added {address}"),
        ListChange::AlreadyPresent => format!("{list}: {address} already listed"),
        ListChange::Removed => format!("{list}: removed {address}"),
        ListChange::NotPresent => format!("{list}: {address} was not listed"),
        ListChange::Invalid => format!("{list}: ignored '{address}' (not an email address)"),
    }
}

/// Process exit code for a cycle result.
///
/// `None` means the cycle failed before completing.
pub fn exit_code(summary: Option<&RunSummary>) -> i32 {
    match summary {
        None => 1,
        Some(s) if s.error_count > 0 => 2,
        Some(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::pipeline::types::Priority;
    use crate::store::VipSource;

    fn outcome(id: &str, status: TriageStatus) -> MessageOutcome {
        MessageOutcome {
            email_id: id.into(),
            status,
            priority: Some(Priority::Low),
            actionable: false,
            source: None,
            draft_id: None,
            sender: "a@x.com".into(),
            subject: "Hello".into(),
            archived: false,
            auto_vip: false,
            error: None,
        }
    }

    fn summary() -> RunSummary {
        let run_at = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let mut s = RunSummary::new(run_at, true, false);
        s.emails_seen = 2;
        s.triaged_count = 2;
        s.archived_count = 1;
        s.drafted_count = 1;

        let mut archived = outcome("e1", TriageStatus::Archived);
        archived.archived = true;
        let mut drafted = outcome("e2", TriageStatus::Drafted);
        drafted.draft_id = Some("d9".into());
        drafted.auto_vip = true;
        drafted.sender = "boss@x.com".into();
        s.details = vec![archived, drafted];
        s
    }

    #[test]
    fn summary_header_and_sections() {
        let text = render_summary(&summary());
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "[APPLY] 2025-03-01T09:30:00Z | seen=2 triaged=2 archived=1 drafted=1 skipped=0 errors=0"
        );
        assert!(text.contains("Archived:\n- e1 | a@x.com | Hello\n"));
        assert!(text.contains("Drafted:\n- e2 | draft=d9 | Hello\n"));
        assert!(text.contains("Auto-promoted VIP senders:\n- boss@x.com\n"));
        assert!(!text.contains("Errors:"));
    }

    #[test]
    fn dry_run_label() {
        let s = RunSummary::new(Utc::now(), false, true);
        assert!(render_summary(&s).starts_with("[DRY-RUN] "));
    }

    #[test]
    fn json_uses_snake_case() {
        let json = render_summary_json(&summary()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["mode"], "apply/rules");
        assert_eq!(value["details"][0]["status"], "archived");
        assert_eq!(value["details"][1]["priority"], "low");
    }

    #[test]
    fn status_without_runs() {
        assert_eq!(render_status(None), "No runs recorded yet.\n");
    }

    #[test]
    fn vip_listing_shows_source() {
        let vips = vec![VipSender {
            address: "boss@x.com".into(),
            source: VipSource::AutoFrequency,
            created_at: Utc::now(),
        }];
        assert_eq!(render_vips(&vips), "VIP senders (1):\n- boss@x.com [auto_frequency]\n");
        assert_eq!(render_blocked(&[]), "No draft-blocked senders.\n");
    }

    #[test]
    fn exit_codes() {
        let mut s = summary();
        assert_eq!(exit_code(Some(&s)), 0);
        s.error_count = 1;
        assert_eq!(exit_code(Some(&s)), 2);
        assert_eq!(exit_code(None), 1);
    }
}
