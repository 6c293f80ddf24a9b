use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use sitecost_core::{category_breakdown, monthly_breakdown};
use sitecost_storage::{legacy_record_path, MemoryLocalStore, MemoryRecordStore, RecordStore};
use sitecost_sync::{AutoCategorizer, DictionaryConfig, ExpenseCache, ItemDictionary};

const DEMO_PROJECT: &str = "riverside-duplex";

#[derive(Debug, Parser)]
#[command(name = "sitecost-cli")]
#[command(about = "Site cost tracker demo over an in-memory record store")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print monthly and per-category breakdowns for the demo project.
    Breakdown {
        #[arg(long, default_value_t = 2026)]
        year: i32,
    },
    /// Suggest a classification for a free-text expense description.
    Suggest {
        details: String,
        /// Also run the typo-tolerant similarity pass.
        #[arg(long)]
        tolerant: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let store = Arc::new(MemoryRecordStore::new());
    seed_demo_data(&store).await?;

    match cli.command.unwrap_or(Commands::Breakdown { year: 2026 }) {
        Commands::Breakdown { year } => {
            let cache = ExpenseCache::new(store.clone());
            cache.invalidate(DEMO_PROJECT).await?;
            let snapshot = cache.get(DEMO_PROJECT);
            println!("project {DEMO_PROJECT}: {} records", snapshot.records.len());

            match monthly_breakdown(&snapshot.records, year) {
                Some(breakdown) => {
                    println!("year {} (grand total {:.2})", breakdown.year, breakdown.grand_total);
                    for month in &breakdown.months {
                        if month.total > 0.0 {
                            println!("  {}: {:.2}", month.yyyy_mm, month.total);
                        }
                    }
                }
                None => println!("no records in any year"),
            }

            println!("by category:");
            for entry in category_breakdown(&snapshot.records) {
                println!("  {} / {}: {:.2}", entry.category, entry.sub_category, entry.total);
            }
        }
        Commands::Suggest { details, tolerant } => {
            let dictionary = Arc::new(ItemDictionary::new(
                store.clone(),
                Arc::new(MemoryLocalStore::new()),
                DictionaryConfig::from_env(),
            ));
            let categorizer = AutoCategorizer::new(dictionary);
            let outcome = categorizer.suggest(&details, "", "", tolerant).await?;
            match outcome.suggestion {
                Some(suggestion) => println!(
                    "suggest: {} / {}",
                    suggestion.category, suggestion.sub_category
                ),
                None if outcome.learn.is_some() => {
                    println!("no match for {details:?}; classification would be learned on confirm")
                }
                None => println!("no suggestion"),
            }
        }
    }

    Ok(())
}

async fn seed_demo_data(store: &Arc<MemoryRecordStore>) -> Result<()> {
    let records = [
        ("r1", "202601", "2026-01-12T00:00:00Z", "Materials", "Hardware Materials", 1800.0),
        ("r2", "202601", "2026-01-20T00:00:00Z", "Labour", "Masonry", 950.0),
        ("r3", "202602", "2026-02-03T00:00:00Z", "Materials", "Steel", 2400.0),
        ("r4", "202602", "2026-02-18T00:00:00Z", "Labour", "Masonry", 950.0),
        ("r5", "202603", "2026-03-07T00:00:00Z", "Materials", "Hardware Materials", 620.0),
    ];
    for (id, yyyy_mm, date_paid, category, sub_category, amount) in records {
        store
            .upsert(
                &legacy_record_path(yyyy_mm, id),
                json!({
                    "id": id,
                    "projectId": DEMO_PROJECT,
                    "yyyyMM": yyyy_mm,
                    "category": category,
                    "subCategory": sub_category,
                    "amount": amount,
                    "datePaid": date_paid,
                    "createdAt": date_paid,
                    "updatedAt": date_paid,
                }),
            )
            .await?;
    }

    let items = [
        ("cement-bags", "cement bags", "Materials", "Hardware Materials"),
        ("steel-rods", "steel rods", "Materials", "Steel"),
        ("mason-day-rate", "mason day rate", "Labour", "Masonry"),
    ];
    for (id, name, category, sub_category) in items {
        let item = sitecost_core::ItemRecord::new(id, name, category, sub_category);
        store
            .upsert(&sitecost_storage::item_path(id), serde_json::to_value(&item)?)
            .await?;
    }
    Ok(())
}
