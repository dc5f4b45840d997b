//! Deterministic red-flag rule engine.
//!
//! The engine scans free text for configured phrases and returns every match as a
//! [`RedFlag`]. Rules can only add flags; nothing here ever lowers a level, so callers combine
//! the result with other signals using `max`.
//!
//! Matching is by whole phrase over normalised text:
//! - Unicode NFKC
//! - lowercase
//! - every non-alphanumeric character becomes a space
//! - whitespace runs collapse to a single space
//!
//! Configured phrases go through the same normalisation, so `"can't breathe"` matches
//! `"I CAN’T  breathe!"`. A phrase must start on a word boundary and end on one, optionally
//! after a plural `s` or `es`: `"seizures"` matches `seizure`, `"heatstroke"` does not match
//! `stroke`.

use crate::constants::{DEFAULT_HIGH_RISK_GROUPS, DEFAULT_RED_FLAG_TABLE, RISK_PROFILE_CATEGORY};
use crate::pipeline::ExtractedFacts;
use crate::{CoreError, CoreResult, TriageLevel};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use unicode_normalization::UnicodeNormalization;

/// A single rule match.
///
/// Flags are ordered so sets of them serialise identically run to run.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RedFlag {
    pub category: String,
    pub matched_term: String,
    pub severity: TriageLevel,
}

/// Result of scanning a single text, as returned by the scan endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ScanReport {
    pub flags: Vec<RedFlag>,
    /// Highest severity across `flags`; absent when nothing matched.
    pub level: Option<TriageLevel>,
    pub primary: Option<RedFlag>,
}

/// One row of the red-flag table as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryRule {
    pub name: String,
    pub severity: TriageLevel,
    pub phrases: Vec<String>,
}

/// The configurable red-flag table.
///
/// Category order is significant: it is the precedence used to pick a primary flag when
/// several flags share the highest severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleTable {
    pub categories: Vec<CategoryRule>,
    pub high_risk_groups: Vec<String>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self {
            categories: DEFAULT_RED_FLAG_TABLE
                .iter()
                .map(|(name, severity, phrases)| CategoryRule {
                    name: (*name).to_owned(),
                    severity: *severity,
                    phrases: phrases.iter().map(|p| (*p).to_owned()).collect(),
                })
                .collect(),
            high_risk_groups: DEFAULT_HIGH_RISK_GROUPS
                .iter()
                .map(|g| (*g).to_owned())
                .collect(),
        }
    }
}

impl RuleTable {
    /// Checks the table is usable before an engine is built from it.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Config` if the table has no categories, a category name is blank
    /// or repeated, or a category has no phrase that survives normalisation.
    pub fn validate(&self) -> CoreResult<()> {
        if self.categories.is_empty() {
            return Err(CoreError::Config(
                "red-flag table must contain at least one category".into(),
            ));
        }

        let mut seen = HashSet::new();
        for category in &self.categories {
            let name = category.name.trim();
            if name.is_empty() {
                return Err(CoreError::Config("red-flag category name cannot be empty".into()));
            }
            if name == RISK_PROFILE_CATEGORY {
                return Err(CoreError::Config(format!(
                    "red-flag category name '{RISK_PROFILE_CATEGORY}' is reserved"
                )));
            }
            if !seen.insert(name.to_owned()) {
                return Err(CoreError::Config(format!(
                    "duplicate red-flag category: '{name}'"
                )));
            }
            if category.phrases.iter().all(|p| normalize_text(p).is_empty()) {
                return Err(CoreError::Config(format!(
                    "red-flag category '{name}' has no usable phrases"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CompiledCategory {
    name: String,
    severity: TriageLevel,
    phrases: Vec<String>,
}

/// Compiled, immutable rule engine.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    categories: Vec<CompiledCategory>,
    high_risk_groups: Vec<String>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::compile(&RuleTable::default())
    }
}

impl RuleEngine {
    /// Validates `table` and builds an engine from it.
    pub fn new(table: &RuleTable) -> CoreResult<Self> {
        table.validate()?;
        Ok(Self::compile(table))
    }

    fn compile(table: &RuleTable) -> Self {
        let categories = table
            .categories
            .iter()
            .map(|category| {
                let mut phrases: Vec<String> = category
                    .phrases
                    .iter()
                    .map(|p| normalize_text(p))
                    .filter(|p| !p.is_empty())
                    .collect();
                phrases.sort();
                phrases.dedup();
                CompiledCategory {
                    name: category.name.trim().to_owned(),
                    severity: category.severity,
                    phrases,
                }
            })
            .collect();

        let high_risk_groups = table
            .high_risk_groups
            .iter()
            .map(|g| normalize_text(g))
            .filter(|g| !g.is_empty())
            .collect();

        Self {
            categories,
            high_risk_groups,
        }
    }

    /// Returns every red flag matched in `text`. Empty text yields an empty set.
    pub fn evaluate(&self, text: &str) -> BTreeSet<RedFlag> {
        let mut flags = BTreeSet::new();
        self.scan_into(&normalize_text(text), &mut flags);
        flags
    }

    /// Evaluates `text` and summarises the result.
    pub fn scan(&self, text: &str) -> ScanReport {
        let flags = self.evaluate(text);
        ScanReport {
            level: max_severity(&flags),
            primary: self.primary_flag(&flags).cloned(),
            flags: flags.into_iter().collect(),
        }
    }

    /// Scans several texts and returns the union of their flags.
    pub fn evaluate_all<'a>(&self, texts: impl IntoIterator<Item = &'a str>) -> BTreeSet<RedFlag> {
        let mut flags = BTreeSet::new();
        for text in texts {
            self.scan_into(&normalize_text(text), &mut flags);
        }
        flags
    }

    /// Scans extracted facts.
    ///
    /// Every fact list and the brief summary are matched against the table. The extracted
    /// severity adds an urgent `risk_profile` flag when it is severe, or when it is moderate
    /// and a risk factor names a high-risk group.
    pub fn evaluate_facts(&self, facts: &ExtractedFacts) -> BTreeSet<RedFlag> {
        let texts = facts
            .symptoms
            .iter()
            .chain(&facts.red_flags)
            .chain(&facts.risk_factors)
            .chain(facts.brief_summary.iter())
            .map(String::as_str);
        let mut flags = self.evaluate_all(texts);

        let severity = facts
            .severity
            .as_deref()
            .map(normalize_text)
            .unwrap_or_default();

        match severity.as_str() {
            "severe" | "high" => {
                flags.insert(RedFlag {
                    category: RISK_PROFILE_CATEGORY.to_owned(),
                    matched_term: format!("severity {severity}"),
                    severity: TriageLevel::Urgent,
                });
            }
            "moderate" | "medium" => {
                let risk_text: Vec<String> =
                    facts.risk_factors.iter().map(|r| normalize_text(r)).collect();
                for group in &self.high_risk_groups {
                    if risk_text.iter().any(|r| r.contains(group.as_str())) {
                        flags.insert(RedFlag {
                            category: RISK_PROFILE_CATEGORY.to_owned(),
                            matched_term: format!("{severity} severity with {group}"),
                            severity: TriageLevel::Urgent,
                        });
                    }
                }
            }
            _ => {}
        }

        flags
    }

    /// Picks the flag that best explains the resolved level.
    ///
    /// Highest severity wins; ties go to the category listed earlier in the table, then to
    /// the lexicographically smallest matched term. Risk-profile flags rank after every
    /// configured category.
    pub fn primary_flag<'a>(&self, flags: &'a BTreeSet<RedFlag>) -> Option<&'a RedFlag> {
        flags.iter().min_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| self.category_rank(&a.category).cmp(&self.category_rank(&b.category)))
                .then_with(|| a.matched_term.cmp(&b.matched_term))
        })
    }

    fn category_rank(&self, name: &str) -> usize {
        self.categories
            .iter()
            .position(|c| c.name == name)
            .unwrap_or(self.categories.len())
    }

    fn scan_into(&self, normalized: &str, flags: &mut BTreeSet<RedFlag>) {
        if normalized.is_empty() {
            return;
        }
        for category in &self.categories {
            for phrase in &category.phrases {
                if contains_phrase(normalized, phrase) {
                    flags.insert(RedFlag {
                        category: category.name.clone(),
                        matched_term: phrase.clone(),
                        severity: category.severity,
                    });
                }
            }
        }
    }
}

/// Whole-phrase match over normalised text, where words are separated by single spaces.
pub(crate) fn contains_phrase(text: &str, phrase: &str) -> bool {
    text.match_indices(phrase).any(|(start, _)| {
        let starts_word = start == 0 || text[..start].ends_with(' ');
        let rest = &text[start + phrase.len()..];
        let ends_word = [Some(rest), rest.strip_prefix('s'), rest.strip_prefix("es")]
            .into_iter()
            .flatten()
            .any(|tail| tail.is_empty() || tail.starts_with(' '));
        starts_word && ends_word
    })
}

/// Highest severity across `flags`, or `None` when there are no flags.
pub fn max_severity<'a>(flags: impl IntoIterator<Item = &'a RedFlag>) -> Option<TriageLevel> {
    flags.into_iter().map(|f| f.severity).max()
}

/// Normalises text for phrase matching. See the module docs for the steps.
pub fn normalize_text(text: &str) -> String {
    let mapped: String = text
        .nfkc()
        .flat_map(char::to_lowercase)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> ExtractedFacts {
        ExtractedFacts::default()
    }

    #[test]
    fn normalize_text_folds_case_punctuation_and_width() {
        assert_eq!(normalize_text("  CHEST-pain!!  now "), "chest pain now");
        assert_eq!(normalize_text("I can’t breathe"), "i can t breathe");
        // Fullwidth letters fold under NFKC.
        assert_eq!(normalize_text("ＣＨＥＳＴ pain"), "chest pain");
        assert_eq!(normalize_text(" \t\n "), "");
    }

    #[test]
    fn chest_pain_narrative_is_emergency() {
        let engine = RuleEngine::default();
        let flags = engine.evaluate("I have crushing chest pain radiating to my left arm");
        assert_eq!(max_severity(&flags), Some(TriageLevel::Emergency));
        assert!(flags
            .iter()
            .any(|f| f.category == "cardiac" && f.matched_term == "chest pain"));
        assert!(flags.iter().any(|f| f.matched_term == "crushing chest"));
    }

    #[test]
    fn apostrophe_variants_match_the_same_phrase() {
        let engine = RuleEngine::default();
        for text in ["I can't breathe", "i CAN’T breathe", "can t  breathe"] {
            let flags = engine.evaluate(text);
            assert!(
                flags.iter().any(|f| f.category == "respiratory"),
                "no respiratory flag for {text:?}"
            );
        }
    }

    #[test]
    fn mild_headache_raises_nothing() {
        let engine = RuleEngine::default();
        assert!(engine.evaluate("mild headache since this morning").is_empty());
        assert!(engine.evaluate("").is_empty());
        assert_eq!(max_severity(&BTreeSet::<RedFlag>::new()), None);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let engine = RuleEngine::default();
        let text = "high fever and a stiff neck, also slurred speech";
        let first = engine.evaluate(text);
        let second = engine.evaluate(text);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
        assert_eq!(max_severity(&first), Some(TriageLevel::Emergency));
    }

    #[test]
    fn urgent_only_categories_resolve_to_urgent() {
        let engine = RuleEngine::default();
        let flags = engine.evaluate("High fever for two days");
        assert_eq!(max_severity(&flags), Some(TriageLevel::Urgent));
    }

    #[test]
    fn facts_are_scanned_alongside_lists() {
        let engine = RuleEngine::default();
        let mut f = facts();
        f.symptoms = vec!["Vomiting blood".into()];
        f.brief_summary = Some("patient reports a seizure".into());
        let flags = engine.evaluate_facts(&f);
        let categories: Vec<_> = flags.iter().map(|f| f.category.as_str()).collect();
        assert!(categories.contains(&"haemorrhage"));
        assert!(categories.contains(&"neurological"));
    }

    #[test]
    fn severe_extracted_severity_adds_urgent_risk_profile() {
        let engine = RuleEngine::default();
        let mut f = facts();
        f.severity = Some("Severe".into());
        let flags = engine.evaluate_facts(&f);
        assert_eq!(flags.len(), 1);
        let flag = flags.iter().next().expect("one flag");
        assert_eq!(flag.category, RISK_PROFILE_CATEGORY);
        assert_eq!(flag.severity, TriageLevel::Urgent);
    }

    #[test]
    fn moderate_severity_needs_a_high_risk_group() {
        let engine = RuleEngine::default();
        let mut f = facts();
        f.severity = Some("moderate".into());
        f.risk_factors = vec!["smoker".into()];
        assert!(engine.evaluate_facts(&f).is_empty());

        f.risk_factors.push("Type 2 Diabetes".into());
        let flags = engine.evaluate_facts(&f);
        assert_eq!(max_severity(&flags), Some(TriageLevel::Urgent));
        assert!(flags
            .iter()
            .any(|f| f.matched_term == "moderate severity with diabetes"));
    }

    #[test]
    fn primary_flag_prefers_severity_then_table_order() {
        let engine = RuleEngine::default();
        let flags = engine.evaluate("stiff neck, slurred speech and chest pain");
        let primary = engine.primary_flag(&flags).expect("flags present");
        // cardiac precedes neurological in the table; infection is only urgent.
        assert_eq!(primary.category, "cardiac");

        let flags = engine.evaluate("stroke with slurred speech");
        let primary = engine.primary_flag(&flags).expect("flags present");
        assert_eq!(primary.matched_term, "slurred speech");
    }

    #[test]
    fn scan_report_summarises_flags() {
        let engine = RuleEngine::default();
        let report = engine.scan("stiff neck and chest pain");
        assert_eq!(report.flags.len(), 2);
        assert_eq!(report.level, Some(TriageLevel::Emergency));
        assert_eq!(
            report.primary.map(|f| f.matched_term),
            Some("chest pain".to_owned())
        );

        let empty = engine.scan("sore toe");
        assert!(empty.flags.is_empty());
        assert_eq!(empty.level, None);
        assert_eq!(empty.primary, None);
    }

    #[test]
    fn custom_table_from_yaml_replaces_defaults() {
        let yaml = r#"
categories:
  - name: burns
    severity: urgent
    phrases: ["Second-degree burn", "blistering"]
"#;
        let table: RuleTable = serde_yaml::from_str(yaml).expect("valid table");
        let engine = RuleEngine::new(&table).expect("valid engine");
        assert!(engine.evaluate("chest pain").is_empty());
        let flags = engine.evaluate("a second degree burn on the hand");
        assert_eq!(max_severity(&flags), Some(TriageLevel::Urgent));
        // High-risk groups fall back to defaults when omitted.
        assert_eq!(table.high_risk_groups.len(), DEFAULT_HIGH_RISK_GROUPS.len());
    }

    #[test]
    fn invalid_tables_are_rejected() {
        let empty = RuleTable {
            categories: vec![],
            high_risk_groups: vec![],
        };
        assert!(matches!(RuleEngine::new(&empty), Err(CoreError::Config(_))));

        let mut duplicate = RuleTable::default();
        let first = duplicate.categories[0].clone();
        duplicate.categories.push(first);
        assert!(RuleEngine::new(&duplicate).is_err());

        let blank_phrases = RuleTable {
            categories: vec![CategoryRule {
                name: "noise".into(),
                severity: TriageLevel::Urgent,
                phrases: vec!["  !! ".into()],
            }],
            high_risk_groups: vec![],
        };
        assert!(RuleEngine::new(&blank_phrases).is_err());
    }

    #[test]
    fn phrases_match_whole_words_only() {
        let engine = RuleEngine::default();
        assert!(engine.evaluate("I want to diet before summer").is_empty());
        assert!(engine.evaluate("mild heatstroke after the match").is_empty());
        assert!(engine.evaluate("my chest painting is drying").is_empty());

        let flags = engine.evaluate("two seizures this morning and high fevers");
        assert!(flags.iter().any(|f| f.matched_term == "seizure"));
        assert!(flags.iter().any(|f| f.matched_term == "high fever"));
        assert!(engine
            .evaluate("sometimes I want to die")
            .iter()
            .any(|f| f.category == "mental_health"));
    }
}
