mod data;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use rand::SeedableRng;
use shared::config::ClusterConfig;
use sqlx::postgres::PgPoolOptions;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "seeder")]
#[command(about = "Database seeding utility for the cluster quota service")]
struct Args {
    #[arg(long, default_value = "2")]
    domains: usize,

    #[arg(long, default_value = "4")]
    projects_per_domain: usize,

    #[arg(long, default_value = "20")]
    commitments: usize,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, default_value = "./quotad.yaml")]
    config: String,

    #[arg(long, default_value = "postgresql://localhost/quotad")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    println!("{}", "=".repeat(80).cyan());
    println!("{}", "Cluster Quota Service Database Seeder".bold().cyan());
    println!("{}", "=".repeat(80).cyan());
    println!();

    let cluster = ClusterConfig::load(&args.config)
        .with_context(|| format!("Failed to load cluster config from {}", args.config))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&args.database_url)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let mut rng: rand::rngs::StdRng = if let Some(seed) = args.seed {
        println!("{} Using seed: {}", "ℹ".blue(), seed);
        rand::SeedableRng::seed_from_u64(seed)
    } else {
        rand::rngs::StdRng::from_entropy()
    };

    let start = Instant::now();

    let resources = data::seed_catalog(&pool, &cluster).await?;
    println!(
        "{} Seeded {} services with {} resources",
        "✓".green(),
        cluster.services.len(),
        resources.len()
    );

    let capacity_rows = data::seed_capacities(&pool, &cluster, &resources, &mut rng).await?;
    println!("{} Seeded {} capacity rows", "✓".green(), capacity_rows);

    let (domains, projects) = data::seed_tenants(
        &pool,
        &cluster,
        &resources,
        args.domains,
        args.projects_per_domain,
        &mut rng,
    )
    .await?;
    println!(
        "{} Seeded {} domains with {} projects",
        "✓".green(),
        domains,
        projects
    );

    let commitments = data::seed_commitments(&pool, &cluster, &mut rng, args.commitments).await?;
    println!("{} Seeded {} confirmed commitments", "✓".green(), commitments);

    println!();
    println!(
        "{} Done in {:.2}s",
        "✓".bold().green(),
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
