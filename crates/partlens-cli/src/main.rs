use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use partlens_contracts::catalog::NONE_SENTINEL;
use partlens_contracts::events::AuditLog;
use partlens_contracts::export::{write_csv, ResultLog};
use partlens_contracts::manifest::load_manifest;
use partlens_engine::{
    CredentialPool, EngineConfig, HttpTransport, PartFinder, PhotoFetcher, RunOptions,
    SessionOutcome, VisionClient, WebPhotoFetcher, DEFAULT_API_BASE,
    DEFAULT_CANDIDATE_REJECTION_CAP, DEFAULT_CONSECUTIVE_NONE_CAP, DEFAULT_LISTING_PASSES,
    DEFAULT_MODEL, DEFAULT_ROUND_CAP,
};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "partlens", version, about = "Catalog number extraction for auction listing photos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process every listing in a manifest and write result files.
    Run(RunArgs),
    /// Run one photograph through the extraction loop.
    Identify(IdentifyArgs),
    /// Re-export a finished run's results as CSV.
    Export(ExportArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    manifest: PathBuf,
    #[arg(long)]
    out_dir: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long = "api-key")]
    api_keys: Vec<String>,
    #[arg(long)]
    instructions: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_ROUND_CAP)]
    round_cap: u32,
    #[arg(long, default_value_t = DEFAULT_CONSECUTIVE_NONE_CAP)]
    none_cap: u32,
    #[arg(long, default_value_t = DEFAULT_CANDIDATE_REJECTION_CAP)]
    rejection_cap: u32,
    #[arg(long, default_value_t = DEFAULT_LISTING_PASSES)]
    passes: u32,
    #[arg(long)]
    run_id: Option<String>,
    /// Keep going past listings that fail with non-quota errors.
    #[arg(long)]
    ignore_errors: bool,
}

#[derive(Debug, Parser)]
struct IdentifyArgs {
    /// Photo to analyze, either an http(s) link or a local path.
    #[arg(long)]
    image: String,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    #[arg(long)]
    api_base: Option<String>,
    #[arg(long = "api-key")]
    api_keys: Vec<String>,
    #[arg(long)]
    instructions: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_ROUND_CAP)]
    round_cap: u32,
    #[arg(long, default_value_t = DEFAULT_CONSECUTIVE_NONE_CAP)]
    none_cap: u32,
    #[arg(long, default_value_t = DEFAULT_CANDIDATE_REJECTION_CAP)]
    rejection_cap: u32,
}

#[derive(Debug, Parser)]
struct ExportArgs {
    #[arg(long)]
    run: PathBuf,
    #[arg(long)]
    out: PathBuf,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("partlens error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_batch(args),
        Command::Identify(args) => run_identify(args),
        Command::Export(args) => run_export(args),
    }
}

fn run_batch(args: RunArgs) -> Result<i32> {
    let jobs = load_manifest(&args.manifest)?;
    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out_dir.join("events.jsonl"));
    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("failed creating {}", args.out_dir.display()))?;

    let config = EngineConfig {
        round_cap: args.round_cap,
        consecutive_none_cap: args.none_cap,
        candidate_rejection_cap: args.rejection_cap,
        listing_passes: args.passes,
        extraction_override: load_instruction_override(args.instructions.as_deref())?,
    };
    let audit = AuditLog::new(events_path, &run_id);
    let mut finder = build_finder(
        &args.model,
        args.api_base.as_deref(),
        &args.api_keys,
        config,
        Some(audit),
    )?;
    let fetcher = WebPhotoFetcher::new()?;
    let options = RunOptions {
        out_dir: args.out_dir.clone(),
        run_id,
        ignore_errors: args.ignore_errors,
    };

    let report = finder.run_batch(&jobs, &fetcher, &options)?;
    println!(
        "Resolved {}/{} listings ({} skipped).",
        report.listings_resolved, report.listings_total, report.listings_skipped
    );
    println!("Results in {}", args.out_dir.display());
    Ok(0)
}

fn run_identify(args: IdentifyArgs) -> Result<i32> {
    let config = EngineConfig {
        round_cap: args.round_cap,
        consecutive_none_cap: args.none_cap,
        candidate_rejection_cap: args.rejection_cap,
        listing_passes: 1,
        extraction_override: load_instruction_override(args.instructions.as_deref())?,
    };
    let audit = args
        .events
        .as_ref()
        .map(|path| AuditLog::new(path.clone(), Uuid::new_v4().to_string()));
    let mut finder = build_finder(
        &args.model,
        args.api_base.as_deref(),
        &args.api_keys,
        config,
        audit,
    )?;

    let fetcher = WebPhotoFetcher::new()?;
    let payload = fetcher.fetch(&args.image)?;
    let outcome = finder.identify_in_photo(&payload)?;
    let (number, resolved, rounds) = match outcome {
        SessionOutcome::Accepted { candidate, rounds } => (candidate, true, rounds),
        SessionOutcome::Exhausted { rounds } => (NONE_SENTINEL.to_string(), false, rounds),
    };
    let usage = finder.usage();
    let result = json!({
        "photo": args.image,
        "number": number,
        "resolved": resolved,
        "rounds": rounds,
        "model": finder.model(),
        "prompt_tokens": usage.prompt_tokens,
        "reply_tokens": usage.reply_tokens,
    });
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn run_export(args: ExportArgs) -> Result<i32> {
    let records = ResultLog::load(&args.run.join("results.jsonl"))?;
    write_csv(&args.out, &records)?;
    println!("Exported {} listings to {}", records.len(), args.out.display());
    Ok(0)
}

fn build_finder(
    model: &str,
    api_base: Option<&str>,
    api_key_flags: &[String],
    config: EngineConfig,
    audit: Option<AuditLog>,
) -> Result<PartFinder<HttpTransport>> {
    let pool = CredentialPool::new(resolve_api_keys(api_key_flags)?)?;
    let transport = HttpTransport::with_api_base(&resolve_api_base(api_base))?;
    let client = VisionClient::new(transport, pool, model);
    let mut finder = PartFinder::new(client, config);
    if let Some(audit) = audit {
        finder = finder.with_audit(audit);
    }
    Ok(finder)
}

/// Flags win; otherwise `PARTLENS_API_KEYS` (comma separated) and then
/// `GEMINI_API_KEY` are consulted.
fn resolve_api_keys(flags: &[String]) -> Result<Vec<String>> {
    if !flags.is_empty() {
        return Ok(flags.to_vec());
    }
    if let Some(raw) = first_non_empty_env(&["PARTLENS_API_KEYS"]) {
        let keys = split_keys(&raw);
        if !keys.is_empty() {
            return Ok(keys);
        }
    }
    if let Some(key) = first_non_empty_env(&["GEMINI_API_KEY"]) {
        return Ok(vec![key]);
    }
    bail!("no API key: pass --api-key or set PARTLENS_API_KEYS / GEMINI_API_KEY");
}

fn resolve_api_base(flag: Option<&str>) -> String {
    if let Some(base) = flag {
        let trimmed = base.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }
    first_non_empty_env(&["PARTLENS_API_BASE", "GEMINI_API_BASE"])
        .unwrap_or_else(|| DEFAULT_API_BASE.to_string())
}

fn split_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
        .collect()
}

fn load_instruction_override(path: Option<&Path>) -> Result<Option<String>> {
    let Some(path) = path else {
        return Ok(None);
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed reading instructions {}", path.display()))?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        bail!("instruction file {} is empty", path.display());
    }
    Ok(Some(trimmed.to_string()))
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    #[test]
    fn run_args_fall_back_to_default_caps() -> Result<()> {
        let cli = Cli::try_parse_from([
            "partlens",
            "run",
            "--manifest",
            "listings.json",
            "--out-dir",
            "out",
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.model, DEFAULT_MODEL);
        assert_eq!(args.round_cap, DEFAULT_ROUND_CAP);
        assert_eq!(args.none_cap, DEFAULT_CONSECUTIVE_NONE_CAP);
        assert_eq!(args.rejection_cap, DEFAULT_CANDIDATE_REJECTION_CAP);
        assert_eq!(args.passes, DEFAULT_LISTING_PASSES);
        assert!(!args.ignore_errors);
        assert!(args.api_keys.is_empty());
        Ok(())
    }

    #[test]
    fn api_key_flag_repeats_into_a_pool() -> Result<()> {
        let cli = Cli::try_parse_from([
            "partlens",
            "identify",
            "--image",
            "label.jpg",
            "--api-key",
            "first",
            "--api-key",
            "second",
        ])?;
        let Command::Identify(args) = cli.command else {
            panic!("expected identify command");
        };
        assert_eq!(args.api_keys, vec!["first", "second"]);
        Ok(())
    }

    #[test]
    fn key_splitting_drops_blank_entries() {
        assert_eq!(split_keys("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(split_keys(" , ,").is_empty());
    }

    #[test]
    fn flag_keys_win_over_environment() -> Result<()> {
        let flags = vec!["flag-key".to_string()];
        assert_eq!(resolve_api_keys(&flags)?, vec!["flag-key"]);
        Ok(())
    }

    #[test]
    fn instruction_override_requires_non_empty_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prompt.txt");
        let mut file = std::fs::File::create(&path)?;
        writeln!(file, "  find the label  ")?;
        assert_eq!(
            load_instruction_override(Some(&path))?,
            Some("find the label".to_string())
        );

        std::fs::write(&path, "   \n")?;
        assert!(load_instruction_override(Some(&path)).is_err());
        assert_eq!(load_instruction_override(None)?, None);
        Ok(())
    }
}
