//! Automation Matcher — the pure decision function.
//!
//! Given a contact's full trigger history (ascending by `created_at`) and the
//! automations watching the incoming event, decide which automations fire.
//! No I/O happens here; gates are recomputed on every pass, nothing is
//! memoized.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use lettermill_core::types::{Automation, Contact, Template, TemplateKind, Trigger};

/// Round key for a contact/automation pair that has never completed.
pub const ORIGIN_ROUND: &str = "origin";

/// One automation that just became eligible.
#[derive(Debug, Clone)]
pub struct FireDecision {
    pub automation_id: String,
    pub template_id: String,
    /// Identifies the window this firing consumes: the RFC3339 timestamp of
    /// the previous completion, or [`ORIGIN_ROUND`]. Used as the uniqueness
    /// key for the conditional completion write.
    pub round_key: String,
    /// Unsubscribed contact + marketing template: the completion is still
    /// recorded, but no send or task may be produced.
    pub suppress_send: bool,
}

/// Evaluate every candidate automation against the contact's history.
///
/// `candidates` pairs each automation with its resolved template; `history`
/// must be ascending by `created_at` for the window computation to be
/// correct.
pub fn evaluate(
    contact: &Contact,
    incoming_event_id: &str,
    history: &[Trigger],
    candidates: &[(Automation, Template)],
) -> Vec<FireDecision> {
    let mut decisions = Vec::new();

    for (automation, template) in candidates {
        if !automation
            .required_event_ids
            .iter()
            .any(|e| e == incoming_event_id)
        {
            continue;
        }

        // Exclusion gate: one excluded event anywhere in history skips the
        // automation, regardless of windows.
        let excluded = history.iter().any(|t| {
            t.event_id
                .as_ref()
                .is_some_and(|e| automation.excluded_event_ids.contains(e))
        });
        if excluded {
            tracing::debug!(
                "Automation '{}' excluded for contact {}",
                automation.name,
                contact.id
            );
            continue;
        }

        // Run-once gate and window selection both hinge on completions
        let last_completion: Option<DateTime<Utc>> = history
            .iter()
            .filter(|t| t.automation_id.as_deref() == Some(automation.id.as_str()))
            .map(|t| t.created_at)
            .max();

        if automation.run_once && last_completion.is_some() {
            continue;
        }

        // Distinct events seen strictly after the last completion
        let windowed: BTreeSet<&str> = history
            .iter()
            .filter(|t| last_completion.is_none_or(|since| t.created_at > since))
            .filter_map(|t| t.event_id.as_deref())
            .collect();
        let required: BTreeSet<&str> = automation
            .required_event_ids
            .iter()
            .map(|s| s.as_str())
            .collect();

        // Exact set equality: duplicates collapse, a superset does not fire
        if windowed != required {
            continue;
        }

        let suppress_send = !contact.subscribed && template.kind == TemplateKind::Marketing;
        tracing::info!(
            "⚡ Automation '{}' fired for contact {}{}",
            automation.name,
            contact.id,
            if suppress_send { " (send suppressed)" } else { "" }
        );
        decisions.push(FireDecision {
            automation_id: automation.id.clone(),
            template_id: template.id.clone(),
            round_key: last_completion
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| ORIGIN_ROUND.to_string()),
            suppress_send,
        });
    }

    decisions
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn contact() -> Contact {
        Contact::new("p1", "ada@example.com")
    }

    fn template(kind: TemplateKind) -> Template {
        Template {
            id: "t1".into(),
            name: "welcome".into(),
            subject: "Hi".into(),
            body: "<p>Hi</p>".into(),
            kind,
        }
    }

    fn automation(required: &[&str], excluded: &[&str], run_once: bool) -> Automation {
        Automation {
            id: "a1".into(),
            project_id: "p1".into(),
            name: "welcome-flow".into(),
            required_event_ids: required.iter().map(|s| s.to_string()).collect(),
            excluded_event_ids: excluded.iter().map(|s| s.to_string()).collect(),
            run_once,
            delay_minutes: 0,
            template_id: "t1".into(),
        }
    }

    fn events(contact_id: &str, ids: &[&str], start: DateTime<Utc>) -> Vec<Trigger> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Trigger::event(contact_id, id, start + Duration::seconds(i as i64)))
            .collect()
    }

    #[test]
    fn test_set_equality_fires_once_despite_duplicates() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A", "B"], &[], false), template(TemplateKind::Marketing))];

        // [A] — incomplete
        let history = events(&c.id, &["A"], t0);
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());

        // [A, A] — duplicate collapses, still incomplete
        let history = events(&c.id, &["A", "A"], t0);
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());

        // [A, A, B] — set now equals {A, B}: fires
        let history = events(&c.id, &["A", "A", "B"], t0);
        let decisions = evaluate(&c, "B", &history, &candidates);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].round_key, ORIGIN_ROUND);
        assert!(!decisions[0].suppress_send);
    }

    #[test]
    fn test_candidate_must_require_incoming_event() {
        let c = contact();
        let history = events(&c.id, &["A"], Utc::now());
        let candidates = vec![(automation(&["A"], &[], false), template(TemplateKind::Marketing))];
        // Incoming event outside the required set never fires
        assert!(evaluate(&c, "X", &history, &candidates).is_empty());
    }

    #[test]
    fn test_exclusion_is_permanent() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A"], &["X"], false), template(TemplateKind::Marketing))];

        let history = events(&c.id, &["X", "A"], t0);
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());

        // Even in a fresh window after a completion, the old X still excludes
        let mut history = events(&c.id, &["X"], t0);
        history.push(Trigger::completion(&c.id, "a1", t0 + Duration::seconds(5)));
        history.push(Trigger::event(&c.id, "A", t0 + Duration::seconds(10)));
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());
    }

    #[test]
    fn test_exclusion_wins_over_required_overlap() {
        // required ∩ excluded ≠ ∅ is not validated; the exclusion gate wins
        let c = contact();
        let history = events(&c.id, &["A"], Utc::now());
        let candidates = vec![(automation(&["A"], &["A"], false), template(TemplateKind::Marketing))];
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());
    }

    #[test]
    fn test_run_once_suppresses_refire() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A"], &[], true), template(TemplateKind::Marketing))];

        let mut history = events(&c.id, &["A"], t0);
        history.push(Trigger::completion(&c.id, "a1", t0 + Duration::seconds(1)));
        history.push(Trigger::event(&c.id, "A", t0 + Duration::seconds(2)));
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());
    }

    #[test]
    fn test_non_run_once_rearms_in_fresh_window() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A", "B"], &[], false), template(TemplateKind::Marketing))];

        let mut history = events(&c.id, &["A", "B"], t0);
        let completed_at = t0 + Duration::seconds(10);
        history.push(Trigger::completion(&c.id, "a1", completed_at));
        // Required set re-occurs strictly after the completion
        history.push(Trigger::event(&c.id, "A", t0 + Duration::seconds(20)));
        history.push(Trigger::event(&c.id, "B", t0 + Duration::seconds(30)));

        let decisions = evaluate(&c, "B", &history, &candidates);
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].round_key, completed_at.to_rfc3339());
    }

    #[test]
    fn test_stale_window_does_not_refire() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A", "B"], &[], false), template(TemplateKind::Marketing))];

        let mut history = events(&c.id, &["A", "B"], t0);
        history.push(Trigger::completion(&c.id, "a1", t0 + Duration::seconds(10)));
        // Only A after the completion — window set is {A}, not {A, B}
        history.push(Trigger::event(&c.id, "A", t0 + Duration::seconds(20)));
        assert!(evaluate(&c, "A", &history, &candidates).is_empty());
    }

    #[test]
    fn test_superset_window_does_not_fire() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A", "B"], &[], false), template(TemplateKind::Marketing))];

        // Unrelated C lands inside the window: {A, C, B} ≠ {A, B}
        let history = events(&c.id, &["A", "C", "B"], t0);
        assert!(evaluate(&c, "B", &history, &candidates).is_empty());
    }

    #[test]
    fn test_unsubscribed_marketing_sets_suppression() {
        let mut c = contact();
        c.subscribed = false;
        let history = events(&c.id, &["A"], Utc::now());

        let marketing = vec![(automation(&["A"], &[], false), template(TemplateKind::Marketing))];
        let decisions = evaluate(&c, "A", &history, &marketing);
        assert_eq!(decisions.len(), 1);
        assert!(decisions[0].suppress_send);

        // Transactional sends are never suppressed
        let transactional =
            vec![(automation(&["A"], &[], false), template(TemplateKind::Transactional))];
        let decisions = evaluate(&c, "A", &history, &transactional);
        assert_eq!(decisions.len(), 1);
        assert!(!decisions[0].suppress_send);
    }

    #[test]
    fn test_completion_markers_do_not_satisfy_required_set() {
        let c = contact();
        let t0 = Utc::now();
        let candidates = vec![(automation(&["A"], &[], false), template(TemplateKind::Marketing))];

        // A completion marker from another automation inside the window must
        // not count as an event
        let mut history = vec![Trigger::completion(&c.id, "other", t0)];
        history.push(Trigger::event(&c.id, "A", t0 + Duration::seconds(1)));
        let decisions = evaluate(&c, "A", &history, &candidates);
        assert_eq!(decisions.len(), 1);
    }
}
