// src/filter.rs
//! Rule-based exclusion of fetched notifications. Pure: no I/O, no state.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::source::Notification;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterRules {
    /// Case-insensitive substrings; a subject containing any of them is ignored.
    pub ignore_subjects_containing: Vec<String>,
    pub ignore_courses_by_id: Vec<i64>,
}

/// Why a notification was filtered out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    Subject(String),
    Course(i64),
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IgnoreReason::Subject(s) => write!(f, "subject contains `{s}`"),
            IgnoreReason::Course(id) => write!(f, "course {id} is ignored"),
        }
    }
}

impl FilterRules {
    /// Trim, lowercase and dedup the subject phrases; dedup course ids.
    pub fn normalize(&mut self) {
        let phrases: BTreeSet<String> = self
            .ignore_subjects_containing
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();
        self.ignore_subjects_containing = phrases.into_iter().collect();

        let courses: BTreeSet<i64> = self.ignore_courses_by_id.iter().copied().collect();
        self.ignore_courses_by_id = courses.into_iter().collect();
    }

    pub fn is_empty(&self) -> bool {
        self.ignore_subjects_containing.is_empty() && self.ignore_courses_by_id.is_empty()
    }

    pub fn ignore_reason(&self, notification: &Notification) -> Option<IgnoreReason> {
        let subject = notification.subject.to_lowercase();
        if let Some(phrase) = self
            .ignore_subjects_containing
            .iter()
            .find(|p| !p.is_empty() && subject.contains(&p.to_lowercase()))
        {
            return Some(IgnoreReason::Subject(phrase.clone()));
        }
        notification
            .course_id
            .filter(|id| self.ignore_courses_by_id.contains(id))
            .map(IgnoreReason::Course)
    }
}

pub fn should_ignore(notification: &Notification, rules: &FilterRules) -> bool {
    rules.ignore_reason(notification).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(subject: &str, course: Option<i64>) -> Notification {
        let mut n = Notification::new(1, subject, "<p>body</p>");
        n.course_id = course;
        n
    }

    #[test]
    fn subject_match_is_case_insensitive() {
        let rules = FilterRules {
            ignore_subjects_containing: vec!["Forum Digest".into()],
            ..Default::default()
        };
        assert!(should_ignore(&note("Your daily FORUM digest", None), &rules));
        assert!(!should_ignore(&note("Assignment graded", None), &rules));
    }

    #[test]
    fn course_rule_needs_a_course_id() {
        let rules = FilterRules {
            ignore_courses_by_id: vec![42],
            ..Default::default()
        };
        assert_eq!(
            rules.ignore_reason(&note("x", Some(42))),
            Some(IgnoreReason::Course(42))
        );
        assert!(!should_ignore(&note("x", Some(7)), &rules));
        assert!(!should_ignore(&note("x", None), &rules));
    }

    #[test]
    fn normalize_drops_blanks_and_duplicates() {
        let mut rules = FilterRules {
            ignore_subjects_containing: vec![" Spam ".into(), "".into(), "spam".into()],
            ignore_courses_by_id: vec![3, 3, 1],
        };
        rules.normalize();
        assert_eq!(rules.ignore_subjects_containing, vec!["spam".to_string()]);
        assert_eq!(rules.ignore_courses_by_id, vec![1, 3]);
    }

    #[test]
    fn empty_rules_ignore_nothing() {
        let rules = FilterRules::default();
        assert!(rules.is_empty());
        assert!(!should_ignore(&note("", Some(1)), &rules));
    }
}
