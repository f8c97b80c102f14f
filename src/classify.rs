//! Rule-based message type assignment and mailing-list tagging.

use regex::Regex;
use tracing::{debug, warn};

use crate::model::{MailingListRule, MatchField, Message, TypeRule};

/// Type assigned when no configured rule matches.
pub const DEFAULT_TYPE: &str = "mail";

/// A type rule with its patterns compiled.
#[derive(Debug, Clone)]
struct CompiledRule {
    name: String,
    entries: Vec<(Vec<MatchField>, Regex)>,
}

/// Evaluates configured type rules and mailing-list rules against messages.
///
/// Rules are compiled once at construction; a rule containing a
/// non-compiling pattern is dropped (it can never match) and logged.
pub struct Classifier {
    rules: Vec<CompiledRule>,
    lists: Vec<MailingListRule>,
}

impl Classifier {
    pub fn new(rules: &[TypeRule], lists: &[MailingListRule]) -> Self {
        let mut compiled = Vec::with_capacity(rules.len());
        'rules: for rule in rules {
            let mut entries = Vec::with_capacity(rule.patterns.len());
            for entry in &rule.patterns {
                match Regex::new(&entry.pattern) {
                    Ok(regex) => entries.push((entry.fields.clone(), regex)),
                    Err(e) => {
                        warn!(
                            rule = %rule.name,
                            pattern = %entry.pattern,
                            error = %e,
                            "Invalid pattern, skipping this type rule"
                        );
                        continue 'rules;
                    }
                }
            }
            compiled.push(CompiledRule {
                name: rule.name.clone(),
                entries,
            });
        }

        Self {
            rules: compiled,
            lists: lists.to_vec(),
        }
    }

    /// Assign a type to a message.
    ///
    /// Rules are evaluated in configured order. A rule matches when all
    /// of its entries match; an entry matches when any field in its set
    /// contains a match for its regex. The first matching rule wins,
    /// except a rule literally named `"mail"`, which is reserved as the
    /// fallthrough type.
    pub fn classify(&self, message: &Message) -> &str {
        for rule in &self.rules {
            if rule.name == DEFAULT_TYPE {
                continue;
            }
            let matched = rule.entries.iter().all(|(fields, regex)| {
                fields
                    .iter()
                    .any(|field| regex.is_match(field.value(message)))
            });
            if matched {
                debug!(
                    message_id = %message.message_id,
                    rule = %rule.name,
                    "Message matched type rule"
                );
                return &rule.name;
            }
        }
        DEFAULT_TYPE
    }

    /// Collect the tags of every mailing-list rule whose substring
    /// occurs in the message's from/to/cc fields.
    pub fn tags(&self, message: &Message) -> Vec<String> {
        self.lists
            .iter()
            .filter(|list| {
                message.from.contains(&list.match_substring)
                    || message.to.contains(&list.match_substring)
                    || message.cc.contains(&list.match_substring)
            })
            .map(|list| list.tag.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PatternRule;
    use std::collections::HashMap;

    fn make_message(from: &str, to: &str, subject: &str) -> Message {
        Message {
            message_id: "m-1".into(),
            topic_id: "t-1".into(),
            subject: subject.into(),
            topic_subject: subject.into(),
            in_reply_to: String::new(),
            references: String::new(),
            from: from.into(),
            to: to.into(),
            cc: String::new(),
            date: String::new(),
            decoded_date: None,
            message_type: String::new(),
            sensitivity: Default::default(),
            body_text: String::new(),
            body_html: String::new(),
            attachments: Vec::new(),
            inline_content_ids: HashMap::new(),
            embedded_messages: Vec::new(),
            is_attached_mail: false,
            parent_message: None,
            is_first_in_topic: false,
            tags: Vec::new(),
        }
    }

    fn rule(name: &str, patterns: Vec<(Vec<MatchField>, &str)>) -> TypeRule {
        TypeRule {
            name: name.into(),
            icon: String::new(),
            patterns: patterns
                .into_iter()
                .map(|(fields, pattern)| PatternRule {
                    fields,
                    pattern: pattern.into(),
                })
                .collect(),
        }
    }

    #[test]
    fn matches_release_rule_on_subject() {
        let rules = vec![rule(
            "Release",
            vec![(vec![MatchField::Subject], r"v\d+\.\d+")],
        )];
        let classifier = Classifier::new(&rules, &[]);
        let m = make_message("a@x.com", "b@x.com", "Release v2.3 available");
        assert_eq!(classifier.classify(&m), "Release");
    }

    #[test]
    fn falls_through_to_mail() {
        let rules = vec![rule(
            "Release",
            vec![(vec![MatchField::Subject], r"v\d+\.\d+")],
        )];
        let classifier = Classifier::new(&rules, &[]);
        let m = make_message("a@x.com", "b@x.com", "Hello");
        assert_eq!(classifier.classify(&m), "mail");
    }

    #[test]
    fn all_entries_must_match() {
        let rules = vec![rule(
            "Newsletter",
            vec![
                (vec![MatchField::From], "news@"),
                (vec![MatchField::Subject], "(?i)weekly"),
            ],
        )];
        let classifier = Classifier::new(&rules, &[]);

        let both = make_message("news@acme.com", "", "Weekly digest");
        assert_eq!(classifier.classify(&both), "Newsletter");

        let only_from = make_message("news@acme.com", "", "Outage notice");
        assert_eq!(classifier.classify(&only_from), "mail");
    }

    #[test]
    fn any_field_in_set_matches_entry() {
        let rules = vec![rule(
            "Team",
            vec![(vec![MatchField::To, MatchField::Cc], "team@acme.com")],
        )];
        let classifier = Classifier::new(&rules, &[]);
        let mut m = make_message("a@x.com", "other@x.com", "hi");
        m.cc = "team@acme.com".into();
        assert_eq!(classifier.classify(&m), "Team");
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            rule("First", vec![(vec![MatchField::Subject], "topic")]),
            rule("Second", vec![(vec![MatchField::Subject], "topic")]),
        ];
        let classifier = Classifier::new(&rules, &[]);
        let m = make_message("a@x.com", "", "a topic here");
        assert_eq!(classifier.classify(&m), "First");
    }

    #[test]
    fn rule_named_mail_is_skipped() {
        let rules = vec![
            rule("mail", vec![(vec![MatchField::Subject], ".*")]),
            rule("Catch", vec![(vec![MatchField::Subject], "specific")]),
        ];
        let classifier = Classifier::new(&rules, &[]);
        let m = make_message("a@x.com", "", "something specific");
        assert_eq!(classifier.classify(&m), "Catch");
    }

    #[test]
    fn invalid_pattern_drops_only_that_rule() {
        let rules = vec![
            rule("Broken", vec![(vec![MatchField::Subject], "([unclosed")]),
            rule("Valid", vec![(vec![MatchField::Subject], "hello")]),
        ];
        let classifier = Classifier::new(&rules, &[]);
        let m = make_message("a@x.com", "", "hello there");
        assert_eq!(classifier.classify(&m), "Valid");
    }

    #[test]
    fn no_rules_classifies_as_mail() {
        let classifier = Classifier::new(&[], &[]);
        let m = make_message("a@x.com", "", "anything");
        assert_eq!(classifier.classify(&m), "mail");
    }

    #[test]
    fn mailing_list_tags_matched_on_any_address_field() {
        let lists = vec![
            MailingListRule {
                match_substring: "dev@acme.com".into(),
                display_name: "Dev list".into(),
                tag: "dev".into(),
            },
            MailingListRule {
                match_substring: "sales@acme.com".into(),
                display_name: "Sales list".into(),
                tag: "sales".into(),
            },
        ];
        let classifier = Classifier::new(&[], &lists);

        let m = make_message("alice@x.com", "dev@acme.com, bob@x.com", "hi");
        assert_eq!(classifier.tags(&m), vec!["dev".to_string()]);

        let none = make_message("alice@x.com", "bob@x.com", "hi");
        assert!(classifier.tags(&none).is_empty());
    }
}
