//! Main entry point for gwasjoin application.

// #![deny(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
// #![warn(missing_docs)]

use clap::{Parser, Subcommand};

pub mod common;
pub mod freq;
pub mod gwas;
pub mod join;
pub mod tissue;
pub mod variant;

/// CLI parser based on clap.
#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "gwasjoin - GWAS association cleaning and annotation",
    long_about = "This tool cleans per-trait GWAS association files and joins them with \
                  dbSNP allele frequencies and GTEx tissue associations"
)]
struct Cli {
    /// Commonly used arguments
    #[command(flatten)]
    common: common::Args,

    /// The sub command to run
    #[command(subcommand)]
    command: Commands,
}

/// Enum supporting the parsing of top-level commands.
#[allow(clippy::large_enum_variant)]
#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean raw per-trait GWAS files.
    Clean(gwas::Args),
    /// Fill the allele frequency cache from dbSNP.
    Fetch(freq::Args),
    /// Join clean GWAS files with allele frequencies and tissue associations.
    Join(join::Args),
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Build a tracing subscriber according to the configuration in `cli.common`.
    let collector = tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_max_level(match cli.common.verbose.log_level() {
            Some(level) => match level {
                log::Level::Error => tracing::Level::ERROR,
                log::Level::Warn => tracing::Level::WARN,
                log::Level::Info => tracing::Level::INFO,
                log::Level::Debug => tracing::Level::DEBUG,
                log::Level::Trace => tracing::Level::TRACE,
            },
            None => tracing::Level::INFO,
        })
        .compact()
        .finish();
    tracing::subscriber::set_global_default(collector)?;

    tracing::info!("Starting gwasjoin...");

    match &cli.command {
        Commands::Clean(args) => gwas::run(&cli.common, args)?,
        Commands::Fetch(args) => freq::run(&cli.common, args)?,
        Commands::Join(args) => join::run(&cli.common, args)?,
    }

    tracing::info!("All done.");

    Ok(())
}

#[cfg(test)]
mod test {
    use clap::{CommandFactory, Parser};

    #[test]
    fn verify_cli() {
        super::Cli::command().debug_assert();
    }

    #[test]
    fn parse_join_defaults() -> Result<(), anyhow::Error> {
        let cli = super::Cli::try_parse_from([
            "gwasjoin",
            "join",
            "--path-cache",
            "cache.tsv",
            "--path-clean-dir",
            "clean",
            "--path-tissue-dir",
            "tissue",
            "--path-output",
            "joined.tsv",
        ])?;

        let super::Commands::Join(args) = cli.command else {
            anyhow::bail!("expected join command");
        };
        assert_eq!(args.variant.assembly, crate::common::Assembly::Grch38);
        assert_eq!(args.source.batch_size, 15);
        assert_eq!(args.source.sleep_ms, 3000);
        assert_eq!(args.source.frequency_study, "dbGaP_PopFreq");
        assert_eq!(
            args.source.build_policy,
            crate::freq::BuildPolicy::FirstReported
        );
        assert!(!args.offline);

        Ok(())
    }
}
