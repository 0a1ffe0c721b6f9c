//! Session and facade layer over the flag engine.
//!
//! [`FlagEngineApi`] is the one-shot entrypoint used by the CLI and the HTTP
//! service: it opens the store per call, migrates if needed, and runs a
//! single hydrate-mutate-persist cycle. [`IngredientEditor`] is the
//! long-lived editing session used by interactive clients, with create/edit
//! modes, change callbacks, and eventually-consistent best-effort writes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;

use allergen_engine_core::{
    aggregate_recipe_flags, aggregate_suggestions, ingredient_flag_cells, scan_text_for_flags,
    AllergenSuggestion, AutoApplyOutcome, BatchApply, CategoryId, Dismissal, DismissalId,
    EngineError, FlagId, FlagTaxonomy, FlagToggle, IngredientFlagState, IngredientId, NoneToggle,
    RecipeFlagVerdict, SuggestionBatch, SuggestionSource,
};
use allergen_engine_store_sqlite::{FlagStore, MigrationReport, SchemaStatus};

pub const API_CONTRACT_VERSION: &str = "allergen-engine-api/v1";

/// Snapshot of one ingredient's persisted flag state.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct IngredientView {
    pub ingredient_id: IngredientId,
    pub assignments: Vec<(FlagId, allergen_engine_core::FlagSource)>,
    pub none_category_ids: Vec<CategoryId>,
    pub dismissals: Vec<Dismissal>,
    pub unassessed_required_categories: Vec<CategoryId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MutationReport<O: Serialize> {
    pub outcome: O,
    pub ingredient: IngredientView,
}

/// Free-text inputs for the suggestion sources a one-shot caller can supply.
/// The name-match source uses the ingredient's own name; product and
/// line-item texts come from label OCR and supplier invoices.
#[derive(Debug, Clone, Default)]
pub struct SuggestionInputs {
    pub name_text: Option<String>,
    pub product_text: Option<String>,
    pub line_item_text: Option<String>,
}

impl SuggestionInputs {
    fn batches(&self, taxonomy: &FlagTaxonomy) -> Vec<SuggestionBatch> {
        let mut batches = Vec::new();
        let sources = [
            (SuggestionSource::NameMatch, &self.name_text),
            (SuggestionSource::ProductScan, &self.product_text),
            (SuggestionSource::LineItem, &self.line_item_text),
        ];
        for (source, text) in sources {
            if let Some(text) = text {
                batches.push(SuggestionBatch {
                    source,
                    suggestions: scan_text_for_flags(taxonomy, text),
                });
            }
        }
        batches
    }
}

/// One-shot facade over the store. Cheap to construct; every method opens
/// the database, brings the schema current, and runs one operation.
#[derive(Debug, Clone)]
pub struct FlagEngineApi {
    db_path: PathBuf,
}

impl FlagEngineApi {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<FlagStore> {
        let mut store = FlagStore::open(&self.db_path)?;
        store.migrate().context("bring schema current")?;
        Ok(store)
    }

    pub fn migrate(&self) -> Result<MigrationReport> {
        let mut store = FlagStore::open(&self.db_path)?;
        store.migrate()
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = FlagStore::open(&self.db_path)?;
        store.schema_status()
    }

    pub fn seed_taxonomy(&self, taxonomy: &FlagTaxonomy) -> Result<()> {
        let mut store = self.open_store()?;
        store.seed_taxonomy(taxonomy)
    }

    pub fn taxonomy(&self) -> Result<FlagTaxonomy> {
        let store = self.open_store()?;
        store.load_taxonomy()
    }

    pub fn ingredient(&self, ingredient_id: IngredientId) -> Result<IngredientView> {
        let store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let state = hydrate(&store, ingredient_id)?;
        Ok(view_of(&taxonomy, ingredient_id, &state))
    }

    /// Toggle one flag and persist the resulting flag set.
    ///
    /// # Errors
    /// Conflict rejections surface as [`EngineError::Conflict`] inside the
    /// `anyhow` chain; callers can `downcast_ref` to present them as
    /// recoverable.
    pub fn toggle_flag(
        &self,
        ingredient_id: IngredientId,
        flag_id: FlagId,
    ) -> Result<MutationReport<FlagToggle>> {
        let mut store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let mut state = hydrate(&store, ingredient_id)?;
        let outcome = state.toggle_flag(&taxonomy, flag_id)?;
        store.replace_ingredient_flags(ingredient_id, &state.assignments())?;
        Ok(MutationReport { outcome, ingredient: view_of(&taxonomy, ingredient_id, &state) })
    }

    pub fn toggle_none(
        &self,
        ingredient_id: IngredientId,
        category_id: CategoryId,
    ) -> Result<MutationReport<NoneToggle>> {
        let mut store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let mut state = hydrate(&store, ingredient_id)?;
        let outcome = state.toggle_none(&taxonomy, category_id)?;
        match &outcome {
            NoneToggle::Asserted { .. } => {
                store.assert_ingredient_none(ingredient_id, category_id)?;
            }
            NoneToggle::Cleared => store.clear_ingredient_none(ingredient_id, category_id)?,
        }
        Ok(MutationReport { outcome, ingredient: view_of(&taxonomy, ingredient_id, &state) })
    }

    /// Compute the pending suggestion list for an ingredient from the given
    /// source texts, filtered against its stored flags and dismissals.
    pub fn suggestions(
        &self,
        ingredient_id: IngredientId,
        inputs: &SuggestionInputs,
    ) -> Result<Vec<AllergenSuggestion>> {
        let store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let state = hydrate(&store, ingredient_id)?;
        Ok(aggregate_suggestions(
            &inputs.batches(&taxonomy),
            &state.active_flag_ids(),
            &state.dismissed_flag_ids(),
        ))
    }

    /// Record a dismissal for a flag. Returns `None` (and stores nothing)
    /// when `dismissed_by` is blank.
    pub fn dismiss(
        &self,
        ingredient_id: IngredientId,
        flag_id: FlagId,
        dismissed_by: &str,
        reason: Option<String>,
        matched_keyword: Option<String>,
    ) -> Result<Option<DismissalId>> {
        let mut store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let flag = taxonomy.flag(flag_id).ok_or(EngineError::UnknownFlag(flag_id))?;
        if dismissed_by.trim().is_empty() {
            return Ok(None);
        }
        let dismissal = Dismissal {
            id: None,
            flag_id: flag.id,
            dismissed_by: dismissed_by.trim().to_string(),
            reason,
            matched_keyword,
        };
        let id = store.create_dismissal(ingredient_id, &dismissal)?;
        Ok(Some(id))
    }

    /// Remove a stored dismissal for a flag. Returns whether one existed.
    pub fn undo_dismissal(&self, ingredient_id: IngredientId, flag_id: FlagId) -> Result<bool> {
        let mut store = self.open_store()?;
        let existing = store
            .list_dismissals(ingredient_id)?
            .into_iter()
            .find(|dismissal| dismissal.flag_id == flag_id);
        match existing.and_then(|dismissal| dismissal.id) {
            Some(id) => store.delete_dismissal(id),
            None => Ok(false),
        }
    }

    /// Run the auto-apply driver against stored state and persist the result.
    pub fn auto_apply(
        &self,
        ingredient_id: IngredientId,
        flag_ids: &[FlagId],
        none_category_ids: &[CategoryId],
    ) -> Result<MutationReport<AutoApplyOutcome>> {
        let mut store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let mut state = hydrate(&store, ingredient_id)?;
        let outcome = state.auto_apply(&taxonomy, flag_ids, none_category_ids)?;
        if !outcome.is_empty() {
            store.replace_ingredient_flags(ingredient_id, &state.assignments())?;
            for category_id in &outcome.asserted_nones {
                store.assert_ingredient_none(ingredient_id, *category_id)?;
            }
        }
        Ok(MutationReport { outcome, ingredient: view_of(&taxonomy, ingredient_id, &state) })
    }

    /// Recipe-level verdicts over the stored state of the given ingredients.
    pub fn recipe_verdicts(&self, ingredient_ids: &[IngredientId]) -> Result<Vec<RecipeFlagVerdict>> {
        let store = self.open_store()?;
        let taxonomy = store.load_taxonomy()?;
        let mut cells = Vec::with_capacity(ingredient_ids.len());
        for ingredient_id in ingredient_ids {
            let active: BTreeSet<FlagId> = store
                .list_ingredient_flags(*ingredient_id)?
                .into_iter()
                .map(|assignment| assignment.flag_id)
                .collect();
            let nones: BTreeSet<CategoryId> =
                store.list_ingredient_nones(*ingredient_id)?.into_iter().collect();
            cells.push(ingredient_flag_cells(&taxonomy, &active, &nones));
        }
        Ok(aggregate_recipe_flags(&taxonomy, &cells))
    }
}

fn hydrate(store: &FlagStore, ingredient_id: IngredientId) -> Result<IngredientFlagState> {
    Ok(IngredientFlagState::hydrate(
        &store.list_ingredient_flags(ingredient_id)?,
        &store.list_ingredient_nones(ingredient_id)?,
        store.list_dismissals(ingredient_id)?,
    ))
}

fn view_of(
    taxonomy: &FlagTaxonomy,
    ingredient_id: IngredientId,
    state: &IngredientFlagState,
) -> IngredientView {
    IngredientView {
        ingredient_id,
        assignments: state.assignments(),
        none_category_ids: state.none_category_ids().iter().copied().collect(),
        dismissals: state.dismissals(),
        unassessed_required_categories: state.unassessed_required_categories(taxonomy),
    }
}

// ---------------------------------------------------------------------------
// Ingredient editor session
// ---------------------------------------------------------------------------

/// A store write the editor attempted and swallowed. Kept so callers can
/// observe the dirty state and retry instead of losing writes silently.
#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct PendingWrite {
    pub op: WriteOp,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOp {
    ReplaceFlags,
    AssertNone(CategoryId),
    ClearNone(CategoryId),
    CreateDismissal(FlagId),
    DeleteDismissal(DismissalId),
}

type ChangeCallback = Box<dyn FnMut(&BTreeSet<FlagId>, &BTreeSet<CategoryId>) + Send>;
type DismissalsCallback = Box<dyn FnMut(&[Dismissal]) + Send>;

enum EditorMode {
    /// New ingredient, no id yet. Nothing is persisted here; the caller
    /// collects state through the change callbacks and saves it with the
    /// parent entity.
    Create,
    /// Existing ingredient. Local mutations are followed by best-effort
    /// store writes.
    Edit { db_path: PathBuf, ingredient_id: IngredientId },
}

/// One ingredient editing session: local-first flag state, suggestion
/// intake, and (in edit mode) eventually-consistent persistence. A failed
/// write never rolls back local state.
pub struct IngredientEditor {
    taxonomy: FlagTaxonomy,
    state: IngredientFlagState,
    mode: EditorMode,
    source_batches: Vec<SuggestionBatch>,
    pending: Vec<AllergenSuggestion>,
    pending_writes: Vec<PendingWrite>,
    on_change: Option<ChangeCallback>,
    on_dismissals_change: Option<DismissalsCallback>,
}

impl IngredientEditor {
    /// Open a session for a not-yet-saved ingredient.
    #[must_use]
    pub fn create(taxonomy: FlagTaxonomy) -> Self {
        Self {
            taxonomy,
            state: IngredientFlagState::new(),
            mode: EditorMode::Create,
            source_batches: Vec::new(),
            pending: Vec::new(),
            pending_writes: Vec::new(),
            on_change: None,
            on_dismissals_change: None,
        }
    }

    /// Open a session for an existing ingredient, hydrating from the store.
    /// Fails closed when the store or its taxonomy is unavailable.
    pub fn edit(db_path: impl Into<PathBuf>, ingredient_id: IngredientId) -> Result<Self> {
        let db_path = db_path.into();
        let mut store = FlagStore::open(&db_path)?;
        store.migrate().context("bring schema current")?;
        let taxonomy = store.load_taxonomy().context("load taxonomy for editor")?;
        let state = hydrate(&store, ingredient_id)?;
        Ok(Self {
            taxonomy,
            state,
            mode: EditorMode::Edit { db_path, ingredient_id },
            source_batches: Vec::new(),
            pending: Vec::new(),
            pending_writes: Vec::new(),
            on_change: None,
            on_dismissals_change: None,
        })
    }

    pub fn set_on_change(&mut self, callback: ChangeCallback) {
        self.on_change = Some(callback);
    }

    pub fn set_on_dismissals_change(&mut self, callback: DismissalsCallback) {
        self.on_dismissals_change = Some(callback);
    }

    #[must_use]
    pub fn taxonomy(&self) -> &FlagTaxonomy {
        &self.taxonomy
    }

    #[must_use]
    pub fn state(&self) -> &IngredientFlagState {
        &self.state
    }

    #[must_use]
    pub fn pending_suggestions(&self) -> &[AllergenSuggestion] {
        &self.pending
    }

    /// Failed store writes accumulated so far, clearing the list.
    pub fn take_pending_writes(&mut self) -> Vec<PendingWrite> {
        std::mem::take(&mut self.pending_writes)
    }

    /// Toggle one flag locally, then persist best-effort.
    ///
    /// # Errors
    /// [`EngineError::Conflict`] when a suitable-for activation is blocked;
    /// the session is unchanged in that case.
    pub fn toggle_flag(&mut self, flag_id: FlagId) -> Result<FlagToggle, EngineError> {
        let outcome = self.state.toggle_flag(&self.taxonomy, flag_id)?;
        self.persist_flag_set();
        self.after_flag_change();
        Ok(outcome)
    }

    pub fn toggle_none(&mut self, category_id: CategoryId) -> Result<NoneToggle, EngineError> {
        let outcome = self.state.toggle_none(&self.taxonomy, category_id)?;
        match &outcome {
            NoneToggle::Asserted { .. } => {
                self.persist(WriteOp::AssertNone(category_id), |store, ingredient_id| {
                    store.assert_ingredient_none(ingredient_id, category_id)
                });
            }
            NoneToggle::Cleared => {
                self.persist(WriteOp::ClearNone(category_id), |store, ingredient_id| {
                    store.clear_ingredient_none(ingredient_id, category_id)
                });
            }
        }
        self.after_flag_change();
        Ok(outcome)
    }

    /// Replace the raw per-source suggestion lists and recompute the pending
    /// list. Dismiss/undo re-run aggregation over these same lists.
    pub fn refresh_suggestions(&mut self, batches: Vec<SuggestionBatch>) {
        self.source_batches = batches;
        self.recompute_pending();
    }

    /// Accept one pending suggestion by flag id.
    ///
    /// # Errors
    /// Same conflict semantics as [`IngredientEditor::toggle_flag`].
    pub fn apply_suggestion(&mut self, flag_id: FlagId) -> Result<FlagToggle, EngineError> {
        let Some(suggestion) =
            self.pending.iter().find(|entry| entry.flag_id == flag_id).cloned()
        else {
            return Err(EngineError::UnknownFlag(flag_id));
        };
        let outcome = self.state.apply_suggestion(&self.taxonomy, &suggestion)?;
        self.persist_flag_set();
        self.after_flag_change();
        Ok(outcome)
    }

    /// Accept every pending suggestion; conflicts skip rather than fail.
    ///
    /// # Errors
    /// Only for suggestions referencing ids outside the taxonomy.
    pub fn apply_all_suggestions(&mut self) -> Result<BatchApply, EngineError> {
        let pending = self.pending.clone();
        let batch = self.state.apply_all_suggestions(&self.taxonomy, &pending)?;
        if !batch.applied.is_empty() {
            self.persist_flag_set();
        }
        self.after_flag_change();
        Ok(batch)
    }

    /// Dismiss a pending suggestion with attribution. Returns `false` (and
    /// changes nothing) for a blank name or a flag not currently pending.
    pub fn dismiss(&mut self, flag_id: FlagId, dismissed_by: &str, reason: Option<String>) -> bool {
        let Some(suggestion) =
            self.pending.iter().find(|entry| entry.flag_id == flag_id).cloned()
        else {
            return false;
        };
        let Some(dismissal) = self.state.confirm_dismissal(&suggestion, dismissed_by, reason)
        else {
            return false;
        };
        self.persist_dismissal(&dismissal);
        self.recompute_pending();
        self.fire_dismissals_changed();
        true
    }

    /// Undo a dismissal, letting the flag reappear on the next aggregation.
    pub fn undo_dismissal(&mut self, flag_id: FlagId) -> bool {
        let Some(dismissal) = self.state.undo_dismissal(flag_id) else {
            return false;
        };
        if let Some(id) = dismissal.id {
            self.persist(WriteOp::DeleteDismissal(id), move |store, _| {
                store.delete_dismissal(id).map(|_| ())
            });
        }
        self.recompute_pending();
        self.fire_dismissals_changed();
        true
    }

    /// Run the auto-apply driver within this session. Sticky markers live in
    /// the session state, so repeated runs with the same inputs are no-ops.
    ///
    /// # Errors
    /// Only for ids outside the taxonomy.
    pub fn auto_apply(
        &mut self,
        flag_ids: &[FlagId],
        none_category_ids: &[CategoryId],
    ) -> Result<AutoApplyOutcome, EngineError> {
        let outcome = self.state.auto_apply(&self.taxonomy, flag_ids, none_category_ids)?;
        if !outcome.applied_flags.is_empty() || !outcome.removed_suitable_for.is_empty() {
            self.persist_flag_set();
        }
        for category_id in &outcome.asserted_nones {
            let category_id = *category_id;
            self.persist(WriteOp::AssertNone(category_id), move |store, ingredient_id| {
                store.assert_ingredient_none(ingredient_id, category_id)
            });
        }
        self.after_flag_change();
        Ok(outcome)
    }

    fn after_flag_change(&mut self) {
        self.recompute_pending();
        let active = self.state.active_flag_ids();
        let nones = self.state.none_category_ids().clone();
        if let Some(callback) = &mut self.on_change {
            callback(&active, &nones);
        }
    }

    fn fire_dismissals_changed(&mut self) {
        let dismissals = self.state.dismissals();
        if let Some(callback) = &mut self.on_dismissals_change {
            callback(&dismissals);
        }
    }

    fn recompute_pending(&mut self) {
        self.pending = aggregate_suggestions(
            &self.source_batches,
            &self.state.active_flag_ids(),
            &self.state.dismissed_flag_ids(),
        );
    }

    fn persist_flag_set(&mut self) {
        let assignments = self.state.assignments();
        self.persist(WriteOp::ReplaceFlags, move |store, ingredient_id| {
            store.replace_ingredient_flags(ingredient_id, &assignments)
        });
    }

    fn persist<F>(&mut self, op: WriteOp, write: F)
    where
        F: FnOnce(&mut FlagStore, IngredientId) -> Result<()>,
    {
        let (db_path, ingredient_id) = match &self.mode {
            EditorMode::Create => return,
            EditorMode::Edit { db_path, ingredient_id } => (db_path.clone(), *ingredient_id),
        };
        let result = FlagStore::open(&db_path).and_then(|mut store| write(&mut store, ingredient_id));
        if let Err(err) = result {
            tracing::warn!(operation = ?op, error = %format!("{err:#}"), "store write failed; keeping local state");
            self.pending_writes.push(PendingWrite { op, error: format!("{err:#}") });
        }
    }

    fn persist_dismissal(&mut self, dismissal: &Dismissal) {
        let (db_path, ingredient_id) = match &self.mode {
            EditorMode::Create => return,
            EditorMode::Edit { db_path, ingredient_id } => (db_path.clone(), *ingredient_id),
        };
        match FlagStore::open(&db_path)
            .and_then(|mut store| store.create_dismissal(ingredient_id, dismissal))
        {
            Ok(id) => self.state.set_dismissal_id(dismissal.flag_id, id),
            Err(err) => {
                tracing::warn!(flag_id = %dismissal.flag_id, error = %format!("{err:#}"), "dismissal write failed; keeping local state");
                self.pending_writes.push(PendingWrite {
                    op: WriteOp::CreateDismissal(dismissal.flag_id),
                    error: format!("{err:#}"),
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Debounced fetch scheduling
// ---------------------------------------------------------------------------

/// Coalesces rapid re-fetch requests: each `schedule` supersedes any pending
/// one, and only the schedule that is still current when its delay elapses
/// actually runs. Superseded fetches are never issued.
///
/// This is the caller-side half of suggestion refresh: while the user types,
/// schedule the fetch of fresh source batches here and feed the result of
/// the one schedule that fires into
/// [`IngredientEditor::refresh_suggestions`].
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    generation: Arc<AtomicU64>,
}

impl Debouncer {
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self { delay, generation: Arc::new(AtomicU64::new(0)) }
    }

    /// Schedule `fetch` to run after the debounce delay unless superseded.
    /// The handle resolves to whether the fetch actually ran.
    pub fn schedule<F, Fut>(&self, fetch: F) -> tokio::task::JoinHandle<bool>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let scheduled = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = Arc::clone(&self.generation);
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if generation.load(Ordering::SeqCst) == scheduled {
                fetch().await;
                true
            } else {
                false
            }
        })
    }

    /// Invalidate any pending schedule without starting a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}
