//! `afe` command line front end for the allergen flag engine.
//!
//! Every command prints a single JSON document on stdout with a
//! `contract_version` field so scripted consumers can detect payload drift.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use allergen_engine_api::{FlagEngineApi, SuggestionInputs};
use allergen_engine_core::{CategoryId, EngineError, FlagCategory, FlagId, FlagTaxonomy, IngredientId};

const CLI_CONTRACT_VERSION: &str = "allergen-engine-cli/v1";

#[derive(Parser)]
#[command(name = "afe", about = "Allergen and dietary flag engine", version)]
struct Cli {
    /// Path to the engine database.
    #[arg(long, global = true, default_value = "allergen.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Database schema management.
    #[command(subcommand)]
    Db(DbCommand),
    /// Flag taxonomy management.
    #[command(subcommand)]
    Taxonomy(TaxonomyCommand),
    /// Per-ingredient flag state.
    #[command(subcommand)]
    Ingredient(IngredientCommand),
    /// Recipe-level aggregation.
    #[command(subcommand)]
    Recipe(RecipeCommand),
}

#[derive(Subcommand)]
enum DbCommand {
    /// Report current and latest schema versions.
    SchemaVersion,
    /// Apply pending migrations.
    Migrate {
        /// Report what would be applied without applying it.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum TaxonomyCommand {
    /// Replace the stored taxonomy from a JSON file of categories.
    Seed {
        #[arg(long)]
        file: PathBuf,
    },
    /// Print the stored taxonomy.
    Show,
}

#[derive(Subcommand)]
enum IngredientCommand {
    /// Print an ingredient's flag state.
    Show {
        #[arg(long)]
        id: i64,
    },
    /// Toggle one flag on or off.
    ToggleFlag {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        flag: i64,
    },
    /// Toggle a category's "none of these apply" assertion.
    ToggleNone {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        category: i64,
    },
    /// Compute pending suggestions from source texts.
    Suggest {
        #[arg(long)]
        id: i64,
        /// Ingredient name text (primary source).
        #[arg(long)]
        name_text: Option<String>,
        /// Product label text, e.g. from an OCR scan.
        #[arg(long)]
        product_text: Option<String>,
        /// Supplier invoice line-item text.
        #[arg(long)]
        line_item_text: Option<String>,
    },
    /// Dismiss a suggested flag with attribution.
    Dismiss {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        flag: i64,
        #[arg(long)]
        by: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        matched_keyword: Option<String>,
    },
    /// Remove a stored dismissal so the flag can be suggested again.
    UndoDismissal {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        flag: i64,
    },
    /// Apply externally sourced flags and none-assertions once each.
    AutoApply {
        #[arg(long)]
        id: i64,
        #[arg(long = "flag")]
        flags: Vec<i64>,
        #[arg(long = "none-category")]
        none_categories: Vec<i64>,
    },
}

#[derive(Subcommand)]
enum RecipeCommand {
    /// Aggregate flag verdicts over a set of ingredients.
    Verdicts {
        #[arg(long = "ingredient", required = true)]
        ingredients: Vec<i64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let api = FlagEngineApi::new(&cli.db);

    match cli.command {
        Command::Db(command) => run_db(&api, command),
        Command::Taxonomy(command) => run_taxonomy(&api, command),
        Command::Ingredient(command) => run_ingredient(&api, command),
        Command::Recipe(command) => run_recipe(&api, command),
    }
}

fn run_db(api: &FlagEngineApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => print_json(serde_json::to_value(api.schema_status()?)?),
        DbCommand::Migrate { dry_run } => {
            if dry_run {
                let status = api.schema_status()?;
                print_json(json!({ "dry_run": true, "would_apply": status.pending }))
            } else {
                print_json(serde_json::to_value(api.migrate()?)?)
            }
        }
    }
}

fn run_taxonomy(api: &FlagEngineApi, command: TaxonomyCommand) -> Result<()> {
    match command {
        TaxonomyCommand::Seed { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read taxonomy file {}", file.display()))?;
            let categories: Vec<FlagCategory> =
                serde_json::from_str(&raw).context("parse taxonomy JSON")?;
            let taxonomy = FlagTaxonomy::new(categories)?;
            api.seed_taxonomy(&taxonomy)?;
            print_json(json!({
                "seeded": true,
                "categories": taxonomy.categories().len(),
            }))
        }
        TaxonomyCommand::Show => print_json(serde_json::to_value(api.taxonomy()?)?),
    }
}

fn run_ingredient(api: &FlagEngineApi, command: IngredientCommand) -> Result<()> {
    match command {
        IngredientCommand::Show { id } => {
            print_json(serde_json::to_value(api.ingredient(IngredientId(id))?)?)
        }
        IngredientCommand::ToggleFlag { id, flag } => {
            match api.toggle_flag(IngredientId(id), FlagId(flag)) {
                Ok(report) => print_json(serde_json::to_value(report)?),
                Err(err) => print_conflict_or_bail(err),
            }
        }
        IngredientCommand::ToggleNone { id, category } => {
            let report = api.toggle_none(IngredientId(id), CategoryId(category))?;
            print_json(serde_json::to_value(report)?)
        }
        IngredientCommand::Suggest { id, name_text, product_text, line_item_text } => {
            let inputs = SuggestionInputs { name_text, product_text, line_item_text };
            let pending = api.suggestions(IngredientId(id), &inputs)?;
            print_json(json!({ "pending": pending }))
        }
        IngredientCommand::Dismiss { id, flag, by, reason, matched_keyword } => {
            let dismissal_id =
                api.dismiss(IngredientId(id), FlagId(flag), &by, reason, matched_keyword)?;
            match dismissal_id {
                Some(dismissal_id) => {
                    print_json(json!({ "dismissed": true, "dismissal_id": dismissal_id }))
                }
                None => print_json(json!({ "dismissed": false, "reason": "blank dismissed-by name" })),
            }
        }
        IngredientCommand::UndoDismissal { id, flag } => {
            let removed = api.undo_dismissal(IngredientId(id), FlagId(flag))?;
            print_json(json!({ "removed": removed }))
        }
        IngredientCommand::AutoApply { id, flags, none_categories } => {
            let flag_ids: Vec<FlagId> = flags.into_iter().map(FlagId).collect();
            let none_ids: Vec<CategoryId> = none_categories.into_iter().map(CategoryId).collect();
            let report = api.auto_apply(IngredientId(id), &flag_ids, &none_ids)?;
            print_json(serde_json::to_value(report)?)
        }
    }
}

fn run_recipe(api: &FlagEngineApi, command: RecipeCommand) -> Result<()> {
    match command {
        RecipeCommand::Verdicts { ingredients } => {
            let ingredient_ids: Vec<IngredientId> =
                ingredients.into_iter().map(IngredientId).collect();
            let verdicts = api.recipe_verdicts(&ingredient_ids)?;
            print_json(json!({ "verdicts": verdicts }))
        }
    }
}

/// Conflict rejections are an expected outcome for operators, not a crash:
/// report them as structured JSON. Everything else propagates.
fn print_conflict_or_bail(err: anyhow::Error) -> Result<()> {
    match err.downcast_ref::<EngineError>() {
        Some(EngineError::Conflict { rejected, blocking }) => print_json(json!({
            "status": "rejected",
            "rejected": rejected,
            "blocking": blocking,
        })),
        _ => Err(err),
    }
}

fn print_json(value: Value) -> Result<()> {
    let enveloped = with_contract_version(value);
    println!("{}", serde_json::to_string_pretty(&enveloped).context("serialize output")?);
    Ok(())
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            map.insert("contract_version".to_string(), json!(CLI_CONTRACT_VERSION));
            Value::Object(map)
        }
        other => json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "data": other,
        }),
    }
}
