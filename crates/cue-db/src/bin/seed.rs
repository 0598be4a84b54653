//! # Seed Data Generator
//!
//! Populates a hall database with demo tables and tariffs for development.
//!
//! ## Usage
//! ```bash
//! # Two rooms of four tables each (default)
//! cargo run -p cue-db --bin seed
//!
//! # Custom layout
//! cargo run -p cue-db --bin seed -- --tables 6 --db ./data/hall.db
//! ```
//!
//! ## Generated Data
//! - Tables named `{Room} {N}` in the rooms `main` and `vip`
//! - Tariffs:
//!   - Standard: $10.00/h, hourly
//!   - Happy hour: $6.00/h, weekdays 14:00-18:00
//!   - Long game: $12.00/h, cheaper past the second hour
//!   - Tournament: $25.00 per session

use chrono::{NaiveTime, Utc, Weekday};
use std::env;
use uuid::Uuid;

use cue_core::{Money, RateType, Table, Tariff, TariffRestrictions, TieredRate, TimeRange};
use cue_db::{Database, DbConfig};

const ROOMS: &[&str] = &["main", "vip"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut per_room: usize = 4;
    let mut db_path = String::from("./cue_hall_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tables" | "-t" => {
                if i + 1 < args.len() {
                    per_room = args[i + 1].parse().unwrap_or(4);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Cue Hall Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -t, --tables <N>   Tables per room (default: 4)");
                println!("  -d, --db <PATH>    Database file path (default: ./cue_hall_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Cue Hall Seed Data Generator");
    println!("============================");
    println!("Database: {}", db_path);
    println!("Tables per room: {}", per_room);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.tables().list().await?;
    if !existing.is_empty() {
        println!("⚠ Database already has {} tables", existing.len());
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let now = Utc::now();
    let mut created = 0;
    for room in ROOMS {
        for n in 1..=per_room {
            let capacity = if *room == "vip" { 6 } else { 4 };
            let table = Table::new(&format!("{} {}", capitalize(room), n), capacity, room, now)?;
            db.tables().save(&table).await?;
            created += 1;
        }
    }
    println!("✓ Created {} tables", created);

    let tariffs = demo_tariffs();
    for tariff in &tariffs {
        db.tariffs().save(tariff).await?;
        println!("  {} ({} {})", tariff.name, tariff.rate, tariff.rate_type.as_str());
    }
    println!("✓ Created {} tariffs", tariffs.len());

    println!();
    println!("✓ Seed complete!");
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn tariff(name: &str, cents: i64, rate_type: RateType) -> Tariff {
    let now = Utc::now();
    Tariff {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        rate: Money::from_cents(cents),
        rate_type,
        free_minutes: 0,
        min_duration_minutes: None,
        max_duration_minutes: None,
        restrictions: TariffRestrictions::default(),
        tiered_rates: Vec::new(),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn demo_tariffs() -> Vec<Tariff> {
    let standard = tariff("Standard", 1000, RateType::Hourly);

    let mut happy_hour = tariff("Happy hour", 600, RateType::Hourly);
    happy_hour.restrictions = TariffRestrictions {
        days_of_week: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        time_ranges: NaiveTime::from_hms_opt(14, 0, 0)
            .zip(NaiveTime::from_hms_opt(18, 0, 0))
            .map(|(start, end)| vec![TimeRange::new(start, end)])
            .unwrap_or_default(),
        min_players: None,
        max_players: None,
    };

    let mut long_game = tariff("Long game", 1200, RateType::Hourly);
    long_game.free_minutes = 5;
    long_game.min_duration_minutes = Some(30);
    long_game.tiered_rates = vec![TieredRate {
        threshold_minutes: 120,
        rate: Money::from_cents(1200),
    }];
    long_game.rate = Money::from_cents(900);

    let tournament = tariff("Tournament", 2500, RateType::Session);

    vec![standard, happy_hour, long_game, tournament]
}
