//! Allergen/dietary flag engine: ingredient-level flag state with conflict
//! resolution, multi-source suggestion intake, and recipe-level aggregation.
//!
//! The engine is pure: all persistence and transport concerns live in the
//! collaborating store and session crates. A [`FlagTaxonomy`] is loaded once
//! per session and passed by reference into every operation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum EngineError {
    /// A suitable-for activation was blocked by an active contains flag.
    #[error("cannot mark \"{rejected}\": conflicts with active flag \"{blocking}\"")]
    Conflict { rejected: String, blocking: String },
    #[error("taxonomy error: {0}")]
    Taxonomy(String),
    #[error("unknown flag id: {0}")]
    UnknownFlag(FlagId),
    #[error("unknown category id: {0}")]
    UnknownCategory(CategoryId),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FlagId(pub i64);

impl Display for FlagId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CategoryId(pub i64);

impl Display for CategoryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct IngredientId(pub i64);

impl Display for IngredientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DismissalId(pub i64);

impl Display for DismissalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-category rule for combining ingredient-level flag truth into a
/// recipe-level verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PropagationType {
    Contains,
    SuitableFor,
}

impl PropagationType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::SuitableFor => "suitable_for",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "contains" => Some(Self::Contains),
            "suitable_for" => Some(Self::SuitableFor),
            _ => None,
        }
    }
}

/// How an active flag assignment came to be on an ingredient.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    Manual,
    Suggested,
    AutoApplied,
}

impl FlagSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Suggested => "suggested",
            Self::AutoApplied => "auto_applied",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manual" => Some(Self::Manual),
            "suggested" => Some(Self::Suggested),
            "auto_applied" => Some(Self::AutoApplied),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Flag {
    pub id: FlagId,
    pub name: String,
    pub code: Option<String>,
    pub icon: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlagCategory {
    pub id: CategoryId,
    pub name: String,
    pub propagation: PropagationType,
    /// Categories that must be explicitly assessed (flag set or "none")
    /// before an ingredient counts as complete.
    pub required: bool,
    pub sort_order: i64,
    pub flags: Vec<Flag>,
}

/// Immutable session-wide reference data: the fixed catalog of flag
/// categories and flags. Constructed once, validated, never mutated.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct FlagTaxonomy {
    categories: Vec<FlagCategory>,
}

impl FlagTaxonomy {
    /// Validate and build a taxonomy from raw category rows.
    ///
    /// # Errors
    /// Returns [`EngineError::Taxonomy`] when a flag id appears in more than
    /// one category, or when a category or flag name is blank.
    pub fn new(mut categories: Vec<FlagCategory>) -> Result<Self, EngineError> {
        let mut seen_flags: BTreeSet<FlagId> = BTreeSet::new();
        let mut seen_categories: BTreeSet<CategoryId> = BTreeSet::new();

        for category in &categories {
            if category.name.trim().is_empty() {
                return Err(EngineError::Taxonomy(format!(
                    "category {} has a blank name",
                    category.id
                )));
            }
            if !seen_categories.insert(category.id) {
                return Err(EngineError::Taxonomy(format!(
                    "duplicate category id: {}",
                    category.id
                )));
            }
            for flag in &category.flags {
                if flag.name.trim().is_empty() {
                    return Err(EngineError::Taxonomy(format!("flag {} has a blank name", flag.id)));
                }
                if !seen_flags.insert(flag.id) {
                    return Err(EngineError::Taxonomy(format!(
                        "flag {} appears in more than one category",
                        flag.id
                    )));
                }
            }
        }

        categories.sort_by(|lhs, rhs| {
            lhs.sort_order.cmp(&rhs.sort_order).then_with(|| lhs.id.cmp(&rhs.id))
        });
        for category in &mut categories {
            category
                .flags
                .sort_by(|lhs, rhs| lhs.sort_order.cmp(&rhs.sort_order).then_with(|| lhs.id.cmp(&rhs.id)));
        }

        Ok(Self { categories })
    }

    #[must_use]
    pub fn categories(&self) -> &[FlagCategory] {
        &self.categories
    }

    #[must_use]
    pub fn category(&self, category_id: CategoryId) -> Option<&FlagCategory> {
        self.categories.iter().find(|category| category.id == category_id)
    }

    #[must_use]
    pub fn flag(&self, flag_id: FlagId) -> Option<&Flag> {
        self.categories
            .iter()
            .find_map(|category| category.flags.iter().find(|flag| flag.id == flag_id))
    }

    /// The category a flag belongs to. Unique by taxonomy construction.
    #[must_use]
    pub fn category_of(&self, flag_id: FlagId) -> Option<&FlagCategory> {
        self.categories
            .iter()
            .find(|category| category.flags.iter().any(|flag| flag.id == flag_id))
    }
}

impl TryFrom<Vec<FlagCategory>> for FlagTaxonomy {
    type Error = EngineError;

    fn try_from(categories: Vec<FlagCategory>) -> Result<Self, Self::Error> {
        Self::new(categories)
    }
}

/// One active flag row on an ingredient, as hydrated from the store.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IngredientFlagAssignment {
    pub ingredient_id: IngredientId,
    pub flag_id: FlagId,
    pub source: FlagSource,
}

/// A user's explicit rejection of a suggestion, with attribution. `id` is
/// absent until the dismissal is durably stored.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Dismissal {
    pub id: Option<DismissalId>,
    pub flag_id: FlagId,
    pub dismissed_by: String,
    pub reason: Option<String>,
    pub matched_keyword: Option<String>,
}

/// An unconfirmed candidate flag proposed by a detection source. Ephemeral:
/// regenerated from scratch on every relevant input change.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AllergenSuggestion {
    pub flag_id: FlagId,
    pub flag_name: String,
    pub flag_code: Option<String>,
    pub category_name: String,
    pub matched_keywords: Vec<String>,
}

// ---------------------------------------------------------------------------
// Conflict matcher
// ---------------------------------------------------------------------------

/// Decide whether a contains-style flag name semantically conflicts with a
/// suitable-for-style flag name, e.g. `"Gluten"` vs `"Gluten Free"`.
///
/// The suitable-for name is normalized by stripping a trailing "free"
/// (case-insensitive) and trimming; both names are lowercased. A conflict
/// holds on exact equality or simple singular/plural variation in either
/// direction. This is a heuristic for small curated taxonomies, not a
/// linguistic match.
#[must_use]
pub fn names_conflict(contains_name: &str, suitable_for_name: &str) -> bool {
    let contains = contains_name.trim().to_lowercase();
    let suitable = suitable_for_name.trim().to_lowercase();
    let base = suitable.strip_suffix("free").unwrap_or(&suitable).trim().to_string();

    if contains.is_empty() || base.is_empty() {
        return false;
    }

    contains == base
        || format!("{contains}s") == base
        || format!("{base}s") == contains
}

// ---------------------------------------------------------------------------
// Ingredient flag state
// ---------------------------------------------------------------------------

/// Outcome of a successful [`IngredientFlagState::toggle_flag`] call.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FlagToggle {
    Deactivated,
    Activated {
        /// "None" assertion cleared for the flag's category, if one was set.
        cleared_none: Option<CategoryId>,
        /// Suitable-for flags removed because a contains activation won.
        removed_suitable_for: Vec<FlagId>,
    },
}

/// Outcome of a successful [`IngredientFlagState::toggle_none`] call.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NoneToggle {
    Cleared,
    Asserted { removed_flags: Vec<FlagId> },
}

/// Outcome of an apply-all batch over pending suggestions.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct BatchApply {
    pub applied: Vec<FlagId>,
    pub skipped_conflicts: Vec<FlagId>,
    pub cleared_nones: Vec<CategoryId>,
    pub removed_suitable_for: Vec<FlagId>,
}

/// Outcome of one auto-apply driver run.
#[derive(Debug, Clone, Default, Serialize, Eq, PartialEq)]
pub struct AutoApplyOutcome {
    pub applied_flags: Vec<FlagId>,
    pub removed_suitable_for: Vec<FlagId>,
    pub asserted_nones: Vec<CategoryId>,
}

impl AutoApplyOutcome {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.applied_flags.is_empty()
            && self.removed_suitable_for.is_empty()
            && self.asserted_nones.is_empty()
    }
}

/// Per-ingredient mutable flag state for one editing session.
///
/// Owns the active flag set, per-category "none" assertions, the working set
/// of dismissals, and the sticky auto-applied markers. For a given category
/// the "none" assertion and a non-empty active set are never simultaneously
/// true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngredientFlagState {
    active: BTreeMap<FlagId, FlagSource>,
    nones: BTreeSet<CategoryId>,
    dismissals: BTreeMap<FlagId, Dismissal>,
    auto_applied_flags: BTreeSet<FlagId>,
    auto_applied_nones: BTreeSet<CategoryId>,
}

impl IngredientFlagState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild state from persisted rows when an ingredient enters edit mode.
    #[must_use]
    pub fn hydrate(
        assignments: &[IngredientFlagAssignment],
        none_category_ids: &[CategoryId],
        dismissals: Vec<Dismissal>,
    ) -> Self {
        let mut state = Self::new();
        for assignment in assignments {
            state.active.insert(assignment.flag_id, assignment.source);
        }
        state.nones.extend(none_category_ids.iter().copied());
        for dismissal in dismissals {
            state.dismissals.insert(dismissal.flag_id, dismissal);
        }
        state
    }

    #[must_use]
    pub fn active_flag_ids(&self) -> BTreeSet<FlagId> {
        self.active.keys().copied().collect()
    }

    /// Active assignments with their provenance, in flag-id order.
    #[must_use]
    pub fn assignments(&self) -> Vec<(FlagId, FlagSource)> {
        self.active.iter().map(|(flag_id, source)| (*flag_id, *source)).collect()
    }

    #[must_use]
    pub fn none_category_ids(&self) -> &BTreeSet<CategoryId> {
        &self.nones
    }

    #[must_use]
    pub fn dismissals(&self) -> Vec<Dismissal> {
        self.dismissals.values().cloned().collect()
    }

    #[must_use]
    pub fn dismissed_flag_ids(&self) -> BTreeSet<FlagId> {
        self.dismissals.keys().copied().collect()
    }

    #[must_use]
    pub fn is_active(&self, flag_id: FlagId) -> bool {
        self.active.contains_key(&flag_id)
    }

    #[must_use]
    pub fn is_none_asserted(&self, category_id: CategoryId) -> bool {
        self.nones.contains(&category_id)
    }

    /// Toggle one flag on or off.
    ///
    /// Deactivation always succeeds. Activation of a suitable-for flag is
    /// rejected while a conflicting contains flag is active; activation of a
    /// contains flag removes conflicting suitable-for flags (contains wins).
    /// Successful activation clears any "none" assertion for the category.
    ///
    /// # Errors
    /// [`EngineError::UnknownFlag`] for ids outside the taxonomy;
    /// [`EngineError::Conflict`] (no state change) for a blocked activation.
    pub fn toggle_flag(
        &mut self,
        taxonomy: &FlagTaxonomy,
        flag_id: FlagId,
    ) -> Result<FlagToggle, EngineError> {
        if self.active.remove(&flag_id).is_some() {
            return Ok(FlagToggle::Deactivated);
        }
        self.activate(taxonomy, flag_id, FlagSource::Manual, true)
    }

    /// Toggle the "none of these apply" assertion for a category. Asserting
    /// deactivates every flag in the category; clearing leaves flags alone.
    ///
    /// # Errors
    /// [`EngineError::UnknownCategory`] for ids outside the taxonomy.
    pub fn toggle_none(
        &mut self,
        taxonomy: &FlagTaxonomy,
        category_id: CategoryId,
    ) -> Result<NoneToggle, EngineError> {
        if self.nones.remove(&category_id) {
            return Ok(NoneToggle::Cleared);
        }

        let category =
            taxonomy.category(category_id).ok_or(EngineError::UnknownCategory(category_id))?;
        let mut removed_flags = Vec::new();
        for flag in &category.flags {
            if self.active.remove(&flag.id).is_some() {
                removed_flags.push(flag.id);
            }
        }
        self.nones.insert(category_id);
        Ok(NoneToggle::Asserted { removed_flags })
    }

    /// Apply one pending suggestion. Delegates to the same activation path as
    /// a manual toggle, including conflict rejection.
    ///
    /// # Errors
    /// Same as [`IngredientFlagState::toggle_flag`] activation.
    pub fn apply_suggestion(
        &mut self,
        taxonomy: &FlagTaxonomy,
        suggestion: &AllergenSuggestion,
    ) -> Result<FlagToggle, EngineError> {
        if self.is_active(suggestion.flag_id) {
            return Ok(FlagToggle::Activated { cleared_none: None, removed_suitable_for: Vec::new() });
        }
        self.activate(taxonomy, suggestion.flag_id, FlagSource::Suggested, true)
    }

    /// Apply every given pending suggestion in one batch. Individual conflict
    /// rejections skip that suggestion rather than failing the batch; the
    /// caller issues a single persistence write for the whole result.
    ///
    /// # Errors
    /// [`EngineError::UnknownFlag`] when a suggestion references an id
    /// outside the taxonomy.
    pub fn apply_all_suggestions(
        &mut self,
        taxonomy: &FlagTaxonomy,
        suggestions: &[AllergenSuggestion],
    ) -> Result<BatchApply, EngineError> {
        let mut batch = BatchApply::default();
        for suggestion in suggestions {
            if self.is_active(suggestion.flag_id) {
                continue;
            }
            match self.activate(taxonomy, suggestion.flag_id, FlagSource::Suggested, true) {
                Ok(FlagToggle::Activated { cleared_none, removed_suitable_for }) => {
                    batch.applied.push(suggestion.flag_id);
                    batch.cleared_nones.extend(cleared_none);
                    batch.removed_suitable_for.extend(removed_suitable_for);
                }
                Ok(FlagToggle::Deactivated) => {}
                Err(EngineError::Conflict { .. }) => {
                    batch.skipped_conflicts.push(suggestion.flag_id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(batch)
    }

    /// Record a dismissal for a suggestion. Refused (returns `None`, no state
    /// change) when the attribution name is blank.
    pub fn confirm_dismissal(
        &mut self,
        suggestion: &AllergenSuggestion,
        dismissed_by: &str,
        reason: Option<String>,
    ) -> Option<Dismissal> {
        if dismissed_by.trim().is_empty() {
            return None;
        }
        let dismissal = Dismissal {
            id: None,
            flag_id: suggestion.flag_id,
            dismissed_by: dismissed_by.trim().to_string(),
            reason,
            matched_keyword: suggestion.matched_keywords.first().cloned(),
        };
        self.dismissals.insert(suggestion.flag_id, dismissal.clone());
        Some(dismissal)
    }

    /// Attach the server-assigned id after a dismissal is durably stored.
    pub fn set_dismissal_id(&mut self, flag_id: FlagId, id: DismissalId) {
        if let Some(dismissal) = self.dismissals.get_mut(&flag_id) {
            dismissal.id = Some(id);
        }
    }

    /// Remove a dismissal, making the flag eligible to reappear on the next
    /// aggregation pass. Returns the removed dismissal so the caller can
    /// delete it remotely when it carries a server id.
    pub fn undo_dismissal(&mut self, flag_id: FlagId) -> Option<Dismissal> {
        self.dismissals.remove(&flag_id)
    }

    /// Apply externally known flag/none assignments exactly once each.
    ///
    /// Auto-apply is authoritative: activation skips the conflict rejection
    /// branch (contains-driven removal of suitable-for flags still happens).
    /// Markers are sticky for the session, so re-running with the same input
    /// after the user removed an auto-applied flag does not re-apply it. A
    /// "none" is only asserted for categories with zero active flags, but
    /// every processed category is marked regardless.
    ///
    /// # Errors
    /// [`EngineError::UnknownFlag`] / [`EngineError::UnknownCategory`] when
    /// an input id is outside the taxonomy.
    pub fn auto_apply(
        &mut self,
        taxonomy: &FlagTaxonomy,
        flag_ids: &[FlagId],
        none_category_ids: &[CategoryId],
    ) -> Result<AutoApplyOutcome, EngineError> {
        let mut outcome = AutoApplyOutcome::default();

        for &flag_id in flag_ids {
            if self.is_active(flag_id) || self.auto_applied_flags.contains(&flag_id) {
                continue;
            }
            match self.activate(taxonomy, flag_id, FlagSource::AutoApplied, false)? {
                FlagToggle::Activated { removed_suitable_for, .. } => {
                    outcome.applied_flags.push(flag_id);
                    outcome.removed_suitable_for.extend(removed_suitable_for);
                }
                FlagToggle::Deactivated => {}
            }
            self.auto_applied_flags.insert(flag_id);
        }

        for &category_id in none_category_ids {
            if self.nones.contains(&category_id) || self.auto_applied_nones.contains(&category_id) {
                continue;
            }
            let category =
                taxonomy.category(category_id).ok_or(EngineError::UnknownCategory(category_id))?;
            let has_active = category.flags.iter().any(|flag| self.is_active(flag.id));
            if !has_active {
                self.nones.insert(category_id);
                outcome.asserted_nones.push(category_id);
            }
            self.auto_applied_nones.insert(category_id);
        }

        Ok(outcome)
    }

    /// Whether a category has been explicitly assessed: a flag set or a
    /// "none" assertion.
    #[must_use]
    pub fn is_category_assessed(&self, category: &FlagCategory) -> bool {
        self.nones.contains(&category.id)
            || category.flags.iter().any(|flag| self.is_active(flag.id))
    }

    /// Required categories that still lack an assessment.
    #[must_use]
    pub fn unassessed_required_categories(&self, taxonomy: &FlagTaxonomy) -> Vec<CategoryId> {
        taxonomy
            .categories()
            .iter()
            .filter(|category| category.required && !self.is_category_assessed(category))
            .map(|category| category.id)
            .collect()
    }

    fn activate(
        &mut self,
        taxonomy: &FlagTaxonomy,
        flag_id: FlagId,
        source: FlagSource,
        reject_on_conflict: bool,
    ) -> Result<FlagToggle, EngineError> {
        let category = taxonomy.category_of(flag_id).ok_or(EngineError::UnknownFlag(flag_id))?;
        let flag = taxonomy.flag(flag_id).ok_or(EngineError::UnknownFlag(flag_id))?;

        let mut removed_suitable_for = Vec::new();
        match category.propagation {
            PropagationType::SuitableFor => {
                if reject_on_conflict {
                    if let Some(blocking) = self.blocking_contains_flag(taxonomy, &flag.name) {
                        return Err(EngineError::Conflict {
                            rejected: flag.name.clone(),
                            blocking,
                        });
                    }
                }
            }
            PropagationType::Contains => {
                // Contains assertions always win over suitable-for assertions.
                removed_suitable_for = self.conflicting_suitable_for_flags(taxonomy, &flag.name);
                for removed in &removed_suitable_for {
                    self.active.remove(removed);
                }
            }
        }

        self.active.insert(flag_id, source);
        let cleared_none = self.nones.remove(&category.id).then_some(category.id);
        Ok(FlagToggle::Activated { cleared_none, removed_suitable_for })
    }

    fn blocking_contains_flag(&self, taxonomy: &FlagTaxonomy, suitable_name: &str) -> Option<String> {
        taxonomy
            .categories()
            .iter()
            .filter(|category| category.propagation == PropagationType::Contains)
            .flat_map(|category| category.flags.iter())
            .find(|flag| self.is_active(flag.id) && names_conflict(&flag.name, suitable_name))
            .map(|flag| flag.name.clone())
    }

    fn conflicting_suitable_for_flags(
        &self,
        taxonomy: &FlagTaxonomy,
        contains_name: &str,
    ) -> Vec<FlagId> {
        taxonomy
            .categories()
            .iter()
            .filter(|category| category.propagation == PropagationType::SuitableFor)
            .flat_map(|category| category.flags.iter())
            .filter(|flag| self.is_active(flag.id) && names_conflict(contains_name, &flag.name))
            .map(|flag| flag.id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Suggestion aggregation
// ---------------------------------------------------------------------------

/// Detection source a suggestion batch came from, in fixed priority order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionSource {
    NameMatch,
    ProductScan,
    LineItem,
    Ai,
}

impl SuggestionSource {
    /// Lower rank wins on duplicate flag ids.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::NameMatch => 0,
            Self::ProductScan => 1,
            Self::LineItem => 2,
            Self::Ai => 3,
        }
    }

    /// Display-provenance tag appended to matched keywords of non-primary
    /// sources. Does not affect de-duplication.
    #[must_use]
    pub fn keyword_tag(self) -> Option<&'static str> {
        match self {
            Self::NameMatch => None,
            Self::ProductScan => Some("(label)"),
            Self::LineItem => Some("(line item)"),
            Self::Ai => Some("(AI)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SuggestionBatch {
    pub source: SuggestionSource,
    pub suggestions: Vec<AllergenSuggestion>,
}

/// Merge candidate suggestions from independent sources into one ordered,
/// de-duplicated pending list.
///
/// Sources are consumed in priority order; the first source wins on a
/// duplicate flag id, so lower-priority sources only fill gaps. Candidates
/// already active or dismissed are filtered out. Iteration order is stable:
/// source priority, then original per-source order.
#[must_use]
pub fn aggregate_suggestions(
    batches: &[SuggestionBatch],
    active_flag_ids: &BTreeSet<FlagId>,
    dismissed_flag_ids: &BTreeSet<FlagId>,
) -> Vec<AllergenSuggestion> {
    let mut ordered: Vec<&SuggestionBatch> = batches.iter().collect();
    ordered.sort_by_key(|batch| batch.source.rank());

    let mut seen: BTreeSet<FlagId> = BTreeSet::new();
    let mut pending = Vec::new();

    for batch in ordered {
        for suggestion in &batch.suggestions {
            if !seen.insert(suggestion.flag_id) {
                continue;
            }
            if active_flag_ids.contains(&suggestion.flag_id)
                || dismissed_flag_ids.contains(&suggestion.flag_id)
            {
                continue;
            }
            let mut suggestion = suggestion.clone();
            if let Some(tag) = batch.source.keyword_tag() {
                for keyword in &mut suggestion.matched_keywords {
                    keyword.push(' ');
                    keyword.push_str(tag);
                }
            }
            pending.push(suggestion);
        }
    }

    pending
}

/// Scan free text (product label, invoice line item) for flag name/code
/// mentions and emit suggestion candidates in taxonomy order.
#[must_use]
pub fn scan_text_for_flags(taxonomy: &FlagTaxonomy, text: &str) -> Vec<AllergenSuggestion> {
    let haystack = text.to_lowercase();
    let mut suggestions = Vec::new();

    for category in taxonomy.categories() {
        for flag in &category.flags {
            let mut matched_keywords = Vec::new();
            if contains_word(&haystack, &flag.name.to_lowercase()) {
                matched_keywords.push(flag.name.clone());
            }
            if let Some(code) = &flag.code {
                if contains_word(&haystack, &code.to_lowercase()) {
                    matched_keywords.push(code.clone());
                }
            }
            if !matched_keywords.is_empty() {
                suggestions.push(AllergenSuggestion {
                    flag_id: flag.id,
                    flag_name: flag.name.clone(),
                    flag_code: flag.code.clone(),
                    category_name: category.name.clone(),
                    matched_keywords,
                });
            }
        }
    }

    suggestions
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    let mut search_from = 0;
    while let Some(offset) = haystack[search_from..].find(needle) {
        let start = search_from + offset;
        let end = start + needle.len();
        let boundary_before =
            haystack[..start].chars().next_back().is_none_or(|ch| !ch.is_alphanumeric());
        let boundary_after = haystack[end..].chars().next().is_none_or(|ch| !ch.is_alphanumeric());
        if boundary_before && boundary_after {
            return true;
        }
        search_from = end;
    }
    false
}

// ---------------------------------------------------------------------------
// Recipe flag aggregation
// ---------------------------------------------------------------------------

/// One (ingredient x flag) cell feeding recipe aggregation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct FlagCell {
    pub has_flag: bool,
    pub is_unassessed: bool,
}

/// Recipe-level verdict for one flag.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecipeFlagVerdict {
    pub flag_id: FlagId,
    pub flag_name: String,
    pub propagation: PropagationType,
    pub has: bool,
    pub unassessed: bool,
}

/// How a consumer should render a verdict: unassessed takes precedence over
/// any has-value, so an unknown is never displayed as a confirmed pass or
/// fail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum VerdictResolution {
    Unassessed,
    Confirmed(bool),
}

impl RecipeFlagVerdict {
    #[must_use]
    pub fn resolution(&self) -> VerdictResolution {
        if self.unassessed {
            VerdictResolution::Unassessed
        } else {
            VerdictResolution::Confirmed(self.has)
        }
    }
}

/// Project one ingredient's state into per-flag cells.
///
/// For `contains` categories unassessed-ness is not tracked: an ingredient
/// that asserted neither the flag nor "none" simply contributes
/// `has_flag = false`. For `suitable_for` categories a cell is unassessed
/// when the category as a whole has no flag and no "none" assertion.
#[must_use]
pub fn ingredient_flag_cells(
    taxonomy: &FlagTaxonomy,
    active_flag_ids: &BTreeSet<FlagId>,
    none_category_ids: &BTreeSet<CategoryId>,
) -> BTreeMap<FlagId, FlagCell> {
    let mut cells = BTreeMap::new();
    for category in taxonomy.categories() {
        let assessed = none_category_ids.contains(&category.id)
            || category.flags.iter().any(|flag| active_flag_ids.contains(&flag.id));
        for flag in &category.flags {
            let is_unassessed = match category.propagation {
                PropagationType::Contains => false,
                PropagationType::SuitableFor => !assessed,
            };
            cells.insert(
                flag.id,
                FlagCell { has_flag: active_flag_ids.contains(&flag.id), is_unassessed },
            );
        }
    }
    cells
}

/// Compute one verdict per flag for a recipe from the cells of every
/// ingredient (direct and via sub-recipes) it contains.
///
/// `contains` flags use a logical OR over `has_flag`; `suitable_for` flags
/// use a logical AND over `has_flag` and a logical OR over `is_unassessed`.
/// A `suitable_for` flag with no cells at all is reported unassessed rather
/// than vacuously suitable. Pure projection: recomputed whenever any
/// ingredient's state changes, no persisted state of its own.
#[must_use]
pub fn aggregate_recipe_flags(
    taxonomy: &FlagTaxonomy,
    ingredient_cells: &[BTreeMap<FlagId, FlagCell>],
) -> Vec<RecipeFlagVerdict> {
    let mut verdicts = Vec::new();

    for category in taxonomy.categories() {
        for flag in &category.flags {
            let verdict = match category.propagation {
                PropagationType::Contains => {
                    let has = ingredient_cells
                        .iter()
                        .any(|cells| cells.get(&flag.id).is_some_and(|cell| cell.has_flag));
                    RecipeFlagVerdict {
                        flag_id: flag.id,
                        flag_name: flag.name.clone(),
                        propagation: category.propagation,
                        has,
                        unassessed: false,
                    }
                }
                PropagationType::SuitableFor => {
                    if ingredient_cells.is_empty() {
                        RecipeFlagVerdict {
                            flag_id: flag.id,
                            flag_name: flag.name.clone(),
                            propagation: category.propagation,
                            has: false,
                            unassessed: true,
                        }
                    } else {
                        let mut has = true;
                        let mut unassessed = false;
                        for cells in ingredient_cells {
                            // A missing cell means the ingredient was never
                            // projected against this flag: unknown, not a pass.
                            let cell = cells
                                .get(&flag.id)
                                .copied()
                                .unwrap_or(FlagCell { has_flag: false, is_unassessed: true });
                            has &= cell.has_flag;
                            unassessed |= cell.is_unassessed;
                        }
                        RecipeFlagVerdict {
                            flag_id: flag.id,
                            flag_name: flag.name.clone(),
                            propagation: category.propagation,
                            has,
                            unassessed,
                        }
                    }
                }
            };
            verdicts.push(verdict);
        }
    }

    verdicts
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn flag(id: i64, name: &str, sort_order: i64) -> Flag {
        Flag {
            id: FlagId(id),
            name: name.to_string(),
            code: None,
            icon: None,
            sort_order,
        }
    }

    fn coded_flag(id: i64, name: &str, code: &str, sort_order: i64) -> Flag {
        Flag {
            id: FlagId(id),
            name: name.to_string(),
            code: Some(code.to_string()),
            icon: None,
            sort_order,
        }
    }

    /// Allergens (contains): Gluten=1, Eggs=2, Peanuts=3, Milk=4.
    /// Free-from (suitable_for): Gluten Free=10, Egg Free=11, Nut Free=12.
    /// Dietary (suitable_for): Vegan=20, Vegetarian=21.
    fn fixture_taxonomy() -> FlagTaxonomy {
        match FlagTaxonomy::new(vec![
            FlagCategory {
                id: CategoryId(1),
                name: "Allergens".to_string(),
                propagation: PropagationType::Contains,
                required: true,
                sort_order: 1,
                flags: vec![
                    flag(1, "Gluten", 1),
                    flag(2, "Eggs", 2),
                    coded_flag(3, "Peanuts", "PN", 3),
                    flag(4, "Milk", 4),
                ],
            },
            FlagCategory {
                id: CategoryId(2),
                name: "Free From".to_string(),
                propagation: PropagationType::SuitableFor,
                required: false,
                sort_order: 2,
                flags: vec![
                    flag(10, "Gluten Free", 1),
                    flag(11, "Egg Free", 2),
                    flag(12, "Nut Free", 3),
                ],
            },
            FlagCategory {
                id: CategoryId(3),
                name: "Dietary".to_string(),
                propagation: PropagationType::SuitableFor,
                required: true,
                sort_order: 3,
                flags: vec![flag(20, "Vegan", 1), flag(21, "Vegetarian", 2)],
            },
        ]) {
            Ok(taxonomy) => taxonomy,
            Err(err) => panic!("fixture taxonomy should be valid: {err}"),
        }
    }

    fn suggestion(flag_id: i64, name: &str, keywords: &[&str]) -> AllergenSuggestion {
        AllergenSuggestion {
            flag_id: FlagId(flag_id),
            flag_name: name.to_string(),
            flag_code: None,
            category_name: "Allergens".to_string(),
            matched_keywords: keywords.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn taxonomy_rejects_flag_in_two_categories() {
        let result = FlagTaxonomy::new(vec![
            FlagCategory {
                id: CategoryId(1),
                name: "A".to_string(),
                propagation: PropagationType::Contains,
                required: false,
                sort_order: 1,
                flags: vec![flag(1, "Gluten", 1)],
            },
            FlagCategory {
                id: CategoryId(2),
                name: "B".to_string(),
                propagation: PropagationType::SuitableFor,
                required: false,
                sort_order: 2,
                flags: vec![flag(1, "Gluten Free", 1)],
            },
        ]);
        assert!(matches!(result, Err(EngineError::Taxonomy(_))));
    }

    #[test]
    fn conflict_matcher_handles_plural_in_both_directions() {
        assert!(names_conflict("Egg", "Eggs Free"));
        assert!(names_conflict("Eggs", "Egg Free"));
        assert!(names_conflict("Gluten", "Gluten Free"));
        assert!(names_conflict("Gluten", "gluten free"));
        assert!(!names_conflict("Milk", "Gluten Free"));
        assert!(!names_conflict("", "Free"));
    }

    #[test]
    fn toggle_activates_and_deactivates() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();

        let outcome = state.toggle_flag(&taxonomy, FlagId(1));
        assert_eq!(
            outcome,
            Ok(FlagToggle::Activated { cleared_none: None, removed_suitable_for: Vec::new() })
        );
        assert!(state.is_active(FlagId(1)));

        let outcome = state.toggle_flag(&taxonomy, FlagId(1));
        assert_eq!(outcome, Ok(FlagToggle::Deactivated));
        assert!(!state.is_active(FlagId(1)));
    }

    #[test]
    fn suitable_for_activation_is_rejected_without_state_change() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(1)).is_ok());

        let before_active = state.active_flag_ids();
        let before_nones = state.none_category_ids().clone();

        let result = state.toggle_flag(&taxonomy, FlagId(10));
        assert_eq!(
            result,
            Err(EngineError::Conflict {
                rejected: "Gluten Free".to_string(),
                blocking: "Gluten".to_string(),
            })
        );
        assert_eq!(state.active_flag_ids(), before_active);
        assert_eq!(state.none_category_ids(), &before_nones);
    }

    #[test]
    fn contains_activation_removes_conflicting_suitable_for() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(11)).is_ok());

        let outcome = state.toggle_flag(&taxonomy, FlagId(2));
        assert_eq!(
            outcome,
            Ok(FlagToggle::Activated {
                cleared_none: None,
                removed_suitable_for: vec![FlagId(11)],
            })
        );
        assert!(state.is_active(FlagId(2)));
        assert!(!state.is_active(FlagId(11)));
    }

    #[test]
    fn none_assertion_clears_category_flags_and_vice_versa() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(1)).is_ok());
        assert!(state.toggle_flag(&taxonomy, FlagId(4)).is_ok());

        let outcome = state.toggle_none(&taxonomy, CategoryId(1));
        assert_eq!(outcome, Ok(NoneToggle::Asserted { removed_flags: vec![FlagId(1), FlagId(4)] }));
        assert!(state.active_flag_ids().is_empty());
        assert!(state.is_none_asserted(CategoryId(1)));

        let outcome = state.toggle_flag(&taxonomy, FlagId(1));
        assert_eq!(
            outcome,
            Ok(FlagToggle::Activated {
                cleared_none: Some(CategoryId(1)),
                removed_suitable_for: Vec::new(),
            })
        );
        assert!(!state.is_none_asserted(CategoryId(1)));
    }

    #[test]
    fn toggle_none_off_leaves_flags_alone() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_none(&taxonomy, CategoryId(3)).is_ok());
        assert_eq!(state.toggle_none(&taxonomy, CategoryId(3)), Ok(NoneToggle::Cleared));
        assert!(!state.is_none_asserted(CategoryId(3)));
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert_eq!(state.toggle_flag(&taxonomy, FlagId(999)), Err(EngineError::UnknownFlag(FlagId(999))));
        assert_eq!(
            state.toggle_none(&taxonomy, CategoryId(999)),
            Err(EngineError::UnknownCategory(CategoryId(999)))
        );
    }

    #[test]
    fn aggregation_deduplicates_by_source_priority() {
        let batches = vec![
            SuggestionBatch {
                source: SuggestionSource::Ai,
                suggestions: vec![suggestion(7, "Soy", &["soy lecithin"])],
            },
            SuggestionBatch {
                source: SuggestionSource::NameMatch,
                suggestions: vec![suggestion(7, "Soy", &["soy"])],
            },
            SuggestionBatch {
                source: SuggestionSource::ProductScan,
                suggestions: vec![suggestion(7, "Soy", &["soya"])],
            },
        ];

        let pending = aggregate_suggestions(&batches, &BTreeSet::new(), &BTreeSet::new());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flag_id, FlagId(7));
        // Name-match batch wins; primary source keywords carry no tag.
        assert_eq!(pending[0].matched_keywords, vec!["soy".to_string()]);
    }

    #[test]
    fn aggregation_tags_non_primary_keywords_and_filters() {
        let active: BTreeSet<FlagId> = [FlagId(1)].into_iter().collect();
        let dismissed: BTreeSet<FlagId> = [FlagId(2)].into_iter().collect();
        let batches = vec![
            SuggestionBatch {
                source: SuggestionSource::ProductScan,
                suggestions: vec![
                    suggestion(1, "Gluten", &["wheat"]),
                    suggestion(3, "Peanuts", &["peanut"]),
                ],
            },
            SuggestionBatch {
                source: SuggestionSource::Ai,
                suggestions: vec![suggestion(2, "Eggs", &["albumen"])],
            },
        ];

        let pending = aggregate_suggestions(&batches, &active, &dismissed);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].flag_id, FlagId(3));
        assert_eq!(pending[0].matched_keywords, vec!["peanut (label)".to_string()]);
    }

    #[test]
    fn aggregation_preserves_per_source_order() {
        let batches = vec![SuggestionBatch {
            source: SuggestionSource::LineItem,
            suggestions: vec![
                suggestion(4, "Milk", &["milk"]),
                suggestion(1, "Gluten", &["flour"]),
            ],
        }];
        let pending = aggregate_suggestions(&batches, &BTreeSet::new(), &BTreeSet::new());
        let ids: Vec<FlagId> = pending.iter().map(|entry| entry.flag_id).collect();
        assert_eq!(ids, vec![FlagId(4), FlagId(1)]);
    }

    #[test]
    fn dismissal_suppresses_suggestion_until_undone() {
        let mut state = IngredientFlagState::new();
        let batches = vec![SuggestionBatch {
            source: SuggestionSource::NameMatch,
            suggestions: vec![suggestion(3, "Peanuts", &["peanut"])],
        }];

        let pending =
            aggregate_suggestions(&batches, &state.active_flag_ids(), &state.dismissed_flag_ids());
        assert_eq!(pending.len(), 1);

        let dismissal = state.confirm_dismissal(&pending[0], "Alex", None);
        assert!(dismissal.is_some());
        let pending =
            aggregate_suggestions(&batches, &state.active_flag_ids(), &state.dismissed_flag_ids());
        assert!(pending.is_empty());

        let removed = state.undo_dismissal(FlagId(3));
        assert!(removed.is_some());
        let pending =
            aggregate_suggestions(&batches, &state.active_flag_ids(), &state.dismissed_flag_ids());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn blank_dismissed_by_is_a_no_op() {
        let mut state = IngredientFlagState::new();
        let pending = suggestion(3, "Peanuts", &["peanut"]);
        assert!(state.confirm_dismissal(&pending, "   ", None).is_none());
        assert!(state.dismissals().is_empty());
    }

    #[test]
    fn apply_suggestion_obeys_conflict_rejection() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(2)).is_ok());

        let egg_free = AllergenSuggestion {
            flag_id: FlagId(11),
            flag_name: "Egg Free".to_string(),
            flag_code: None,
            category_name: "Free From".to_string(),
            matched_keywords: vec!["egg free".to_string()],
        };
        let result = state.apply_suggestion(&taxonomy, &egg_free);
        assert!(matches!(result, Err(EngineError::Conflict { .. })));
        assert!(!state.is_active(FlagId(11)));
    }

    #[test]
    fn apply_all_skips_conflicts_and_clears_nones() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_none(&taxonomy, CategoryId(1)).is_ok());
        assert!(state.toggle_flag(&taxonomy, FlagId(2)).is_ok());

        let suggestions = vec![
            suggestion(3, "Peanuts", &["peanut"]),
            AllergenSuggestion {
                flag_id: FlagId(11),
                flag_name: "Egg Free".to_string(),
                flag_code: None,
                category_name: "Free From".to_string(),
                matched_keywords: vec![],
            },
        ];
        let batch = match state.apply_all_suggestions(&taxonomy, &suggestions) {
            Ok(batch) => batch,
            Err(err) => panic!("apply all should succeed: {err}"),
        };
        assert_eq!(batch.applied, vec![FlagId(3)]);
        assert_eq!(batch.skipped_conflicts, vec![FlagId(11)]);
        assert_eq!(batch.cleared_nones, vec![CategoryId(1)]);
        assert!(state.is_active(FlagId(3)));
        assert!(!state.is_none_asserted(CategoryId(1)));
    }

    #[test]
    fn auto_apply_is_idempotent_and_sticky() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        let flags = vec![FlagId(1), FlagId(3)];
        let nones = vec![CategoryId(3)];

        let first = match state.auto_apply(&taxonomy, &flags, &nones) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert_eq!(first.applied_flags, vec![FlagId(1), FlagId(3)]);
        assert_eq!(first.asserted_nones, vec![CategoryId(3)]);

        let second = match state.auto_apply(&taxonomy, &flags, &nones) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert!(second.is_empty());

        // Manual removal must not be undone by a third run.
        assert_eq!(state.toggle_flag(&taxonomy, FlagId(1)), Ok(FlagToggle::Deactivated));
        let third = match state.auto_apply(&taxonomy, &flags, &nones) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert!(third.is_empty());
        assert!(!state.is_active(FlagId(1)));
    }

    #[test]
    fn auto_apply_wins_over_suitable_for_but_never_overwrites_user_flags_with_none() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(10)).is_ok());
        assert!(state.toggle_flag(&taxonomy, FlagId(20)).is_ok());

        // Contains auto-flag removes the conflicting suitable-for flag.
        let outcome = match state.auto_apply(&taxonomy, &[FlagId(1)], &[CategoryId(3)]) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert_eq!(outcome.applied_flags, vec![FlagId(1)]);
        assert_eq!(outcome.removed_suitable_for, vec![FlagId(10)]);
        // Dietary category has a user-entered flag: "none" is not asserted,
        // but the category is still marked processed.
        assert!(outcome.asserted_nones.is_empty());
        assert!(state.is_active(FlagId(20)));
        assert!(!state.is_none_asserted(CategoryId(3)));

        assert_eq!(state.toggle_flag(&taxonomy, FlagId(20)), Ok(FlagToggle::Deactivated));
        let rerun = match state.auto_apply(&taxonomy, &[FlagId(1)], &[CategoryId(3)]) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert!(rerun.asserted_nones.is_empty());
    }

    #[test]
    fn auto_applied_suitable_for_skips_rejection() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert!(state.toggle_flag(&taxonomy, FlagId(2)).is_ok());

        let outcome = match state.auto_apply(&taxonomy, &[FlagId(11)], &[]) {
            Ok(outcome) => outcome,
            Err(err) => panic!("auto apply should succeed: {err}"),
        };
        assert_eq!(outcome.applied_flags, vec![FlagId(11)]);
        assert!(state.is_active(FlagId(11)));
        assert!(state.is_active(FlagId(2)));
    }

    #[test]
    fn required_category_assessment_tracking() {
        let taxonomy = fixture_taxonomy();
        let mut state = IngredientFlagState::new();
        assert_eq!(
            state.unassessed_required_categories(&taxonomy),
            vec![CategoryId(1), CategoryId(3)]
        );
        assert!(state.toggle_flag(&taxonomy, FlagId(1)).is_ok());
        assert!(state.toggle_none(&taxonomy, CategoryId(3)).is_ok());
        assert!(state.unassessed_required_categories(&taxonomy).is_empty());
    }

    #[test]
    fn text_scan_matches_whole_words_and_codes() {
        let taxonomy = fixture_taxonomy();
        let found = scan_text_for_flags(&taxonomy, "Contains: wheat gluten, PN traces. Glutenous.");
        let ids: Vec<FlagId> = found.iter().map(|entry| entry.flag_id).collect();
        // "Glutenous" must not match "Gluten" again; "PN" matches the code.
        assert_eq!(ids, vec![FlagId(1), FlagId(3)]);
        assert_eq!(found[1].matched_keywords, vec!["PN".to_string()]);
    }

    #[test]
    fn recipe_contains_union() {
        let taxonomy = fixture_taxonomy();
        let with_gluten: BTreeSet<FlagId> = [FlagId(1)].into_iter().collect();
        let empty = BTreeSet::new();
        let no_nones = BTreeSet::new();

        let cells = vec![
            ingredient_flag_cells(&taxonomy, &with_gluten, &no_nones),
            ingredient_flag_cells(&taxonomy, &empty, &no_nones),
            ingredient_flag_cells(&taxonomy, &empty, &no_nones),
        ];
        let verdicts = aggregate_recipe_flags(&taxonomy, &cells);
        let gluten = verdicts.iter().find(|verdict| verdict.flag_id == FlagId(1));
        match gluten {
            Some(verdict) => {
                assert!(verdict.has);
                assert!(!verdict.unassessed);
                assert_eq!(verdict.resolution(), VerdictResolution::Confirmed(true));
            }
            None => panic!("missing verdict for Gluten"),
        }
    }

    #[test]
    fn recipe_suitable_for_intersection_with_unassessed_propagation() {
        let taxonomy = fixture_taxonomy();
        let vegan: BTreeSet<FlagId> = [FlagId(20)].into_iter().collect();
        let no_flags = BTreeSet::new();
        let no_nones = BTreeSet::new();
        let dietary_none: BTreeSet<CategoryId> = [CategoryId(3)].into_iter().collect();

        // Two vegan ingredients plus one unassessed: verdict is unknown.
        let cells = vec![
            ingredient_flag_cells(&taxonomy, &vegan, &no_nones),
            ingredient_flag_cells(&taxonomy, &vegan, &no_nones),
            ingredient_flag_cells(&taxonomy, &no_flags, &no_nones),
        ];
        let verdicts = aggregate_recipe_flags(&taxonomy, &cells);
        let verdict = verdicts.iter().find(|verdict| verdict.flag_id == FlagId(20));
        match verdict {
            Some(verdict) => {
                assert!(verdict.unassessed);
                assert_eq!(verdict.resolution(), VerdictResolution::Unassessed);
            }
            None => panic!("missing verdict for Vegan"),
        }

        // Replacing the unassessed ingredient with an assessed non-vegan one
        // gives a confirmed negative.
        let cells = vec![
            ingredient_flag_cells(&taxonomy, &vegan, &no_nones),
            ingredient_flag_cells(&taxonomy, &no_flags, &dietary_none),
        ];
        let verdicts = aggregate_recipe_flags(&taxonomy, &cells);
        let verdict = verdicts.iter().find(|verdict| verdict.flag_id == FlagId(20));
        match verdict {
            Some(verdict) => {
                assert!(!verdict.unassessed);
                assert_eq!(verdict.resolution(), VerdictResolution::Confirmed(false));
            }
            None => panic!("missing verdict for Vegan"),
        }
    }

    #[test]
    fn unassessed_cell_overrides_unanimous_suitable_for() {
        let taxonomy = fixture_taxonomy();
        let mut assessed_vegan = BTreeMap::new();
        assessed_vegan.insert(FlagId(20), FlagCell { has_flag: true, is_unassessed: false });
        let mut unverified_vegan = BTreeMap::new();
        unverified_vegan.insert(FlagId(20), FlagCell { has_flag: true, is_unassessed: true });

        // Every cell says vegan, but one of them is unverified: the AND
        // would pass, and the verdict must still read as unknown.
        let cells = vec![assessed_vegan.clone(), assessed_vegan, unverified_vegan];
        let verdicts = aggregate_recipe_flags(&taxonomy, &cells);
        let verdict = verdicts.iter().find(|verdict| verdict.flag_id == FlagId(20));
        match verdict {
            Some(verdict) => {
                assert!(verdict.has);
                assert!(verdict.unassessed);
                assert_eq!(verdict.resolution(), VerdictResolution::Unassessed);
            }
            None => panic!("missing verdict for Vegan"),
        }
    }

    #[test]
    fn recipe_with_no_ingredients_is_unassessed_for_suitable_for() {
        let taxonomy = fixture_taxonomy();
        let verdicts = aggregate_recipe_flags(&taxonomy, &[]);
        for verdict in &verdicts {
            match verdict.propagation {
                PropagationType::Contains => assert!(!verdict.has && !verdict.unassessed),
                PropagationType::SuitableFor => assert!(verdict.unassessed),
            }
        }
    }

    proptest! {
        /// Any constructed pair of a base word (optionally pluralized on the
        /// contains side) and its free-from counterpart must conflict,
        /// whatever the casing or suffix spacing.
        #[test]
        fn conflict_matcher_accepts_constructed_free_from_pairs(
            base in "[a-z]{2,10}",
            pluralize_contains in proptest::bool::ANY,
            spaced_suffix in proptest::bool::ANY,
            uppercase_contains in proptest::bool::ANY,
        ) {
            let mut contains = if pluralize_contains {
                format!("{base}s")
            } else {
                base.clone()
            };
            if uppercase_contains {
                contains = contains.to_uppercase();
            }
            let suitable = if spaced_suffix {
                format!("{base} Free")
            } else {
                format!("{base}free")
            };
            prop_assert!(
                names_conflict(&contains, &suitable),
                "{contains:?} should conflict with {suitable:?}"
            );
        }

        /// Unrelated base words never conflict, even with the free-from
        /// suffix attached.
        #[test]
        fn conflict_matcher_rejects_unrelated_pairs(
            left in "[a-z]{3,10}",
            right in "[a-z]{3,10}",
        ) {
            prop_assume!(
                left != right
                    && format!("{left}s") != right
                    && format!("{right}s") != left
            );
            let right_free = format!("{right} Free");
            prop_assert!(!names_conflict(&left, &right_free));
        }

        #[test]
        fn mutual_exclusion_holds_after_any_operation_sequence(
            ops in proptest::collection::vec((0_u8..4, 0_i64..25), 0..40)
        ) {
            let taxonomy = fixture_taxonomy();
            let mut state = IngredientFlagState::new();

            for (kind, id) in ops {
                match kind {
                    0 => { let _ = state.toggle_flag(&taxonomy, FlagId(id)); }
                    1 => { let _ = state.toggle_none(&taxonomy, CategoryId(id % 4)); }
                    2 => { let _ = state.auto_apply(&taxonomy, &[FlagId(id)], &[]); }
                    _ => { let _ = state.auto_apply(&taxonomy, &[], &[CategoryId(id % 4)]); }
                }

                for category in taxonomy.categories() {
                    if state.is_none_asserted(category.id) {
                        let any_active =
                            category.flags.iter().any(|flag| state.is_active(flag.id));
                        prop_assert!(!any_active, "none + active in category {}", category.id);
                    }
                }
            }
        }
    }
}
