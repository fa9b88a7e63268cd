use clap::{Args, Parser, Subcommand};

use mintforge_core::TokenId;

/// Ledger-driven synthesis pipeline worker.
#[derive(Debug, Parser)]
#[command(name = "mintforge", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the scheduler until SIGINT or SIGTERM.
    Run,

    /// Create jobs for ledger identifiers the job store is missing.
    Recover(RecoverArgs),

    /// Return failed or stuck jobs to pending with a fresh retry budget.
    ResetFailed(ResetFailedArgs),

    /// List failed jobs with their last error.
    ListFailed(ListFailedArgs),

    /// Print job counts per status.
    Stats,
}

#[derive(Debug, Clone, Default, Args)]
pub struct RecoverArgs {
    /// Examine at most this many missing identifiers.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Report the gap without creating jobs.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ResetFailedArgs {
    /// Reset only these identifiers (repeatable). Defaults to every
    /// resettable job, oldest first.
    #[arg(long = "id", value_name = "TOKEN_ID")]
    pub ids: Vec<TokenId>,

    /// Reset at most this many jobs.
    #[arg(long, default_value_t = 100)]
    pub limit: usize,

    /// Show what would be reset without changing anything.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Args)]
pub struct ListFailedArgs {
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Command {
        let mut argv = vec!["mintforge"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv).command
    }

    #[test]
    fn parses_run_and_stats() {
        assert!(matches!(parse(&["run"]), Command::Run));
        assert!(matches!(parse(&["stats"]), Command::Stats));
    }

    #[test]
    fn parses_recover_flags() {
        let Command::Recover(args) = parse(&["recover", "--limit", "25", "--dry-run"]) else {
            panic!("expected recover");
        };
        assert_eq!(args.limit, Some(25));
        assert!(args.dry_run);

        let Command::Recover(args) = parse(&["recover"]) else {
            panic!("expected recover");
        };
        assert_eq!(args.limit, None);
        assert!(!args.dry_run);
    }

    #[test]
    fn parses_repeated_reset_ids() {
        let Command::ResetFailed(args) = parse(&["reset-failed", "--id", "7", "--id", "42"]) else {
            panic!("expected reset-failed");
        };
        let ids: Vec<u64> = args.ids.iter().map(TokenId::get).collect();
        assert_eq!(ids, vec![7, 42]);
        assert_eq!(args.limit, 100);
        assert!(!args.dry_run);
    }

    #[test]
    fn rejects_zero_token_id() {
        let result = Cli::try_parse_from(["mintforge", "reset-failed", "--id", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn list_failed_has_default_limit() {
        let Command::ListFailed(args) = parse(&["list-failed"]) else {
            panic!("expected list-failed");
        };
        assert_eq!(args.limit, 50);
    }
}
