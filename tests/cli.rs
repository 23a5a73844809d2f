use std::process::Command;

use anyhow::Result;
use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::*;

macro_rules! cargo_run {
    ($($args:expr),*) => {
        {
            let mut cmd = Command::cargo_bin("imboard")?;
            cmd.env_remove("IMBOARD_DATABASE_URL");
            $(cmd.arg($args);)*
            cmd.assert()
        }
    };
}

#[test]
fn help_lists_subcommands() -> Result<()> {
    cargo_run!("--help")
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("backfill"))
        .stdout(predicate::str::contains("cleanup"))
        .stdout(predicate::str::contains("analyze"));
    Ok(())
}

#[rstest]
#[case::serve("serve", "--addr")]
#[case::serve_thresholds("serve", "--text-similarity-threshold")]
#[case::backfill("backfill", "--budget")]
#[case::backfill_breaker("backfill", "--max-failures")]
#[case::cleanup("cleanup", "--ignored-categories")]
#[case::analyze("analyze", "--force")]
fn subcommand_help_shows_options(#[case] subcmd: &str, #[case] flag: &str) -> Result<()> {
    cargo_run!(subcmd, "--help").success().stdout(predicate::str::contains(flag));
    Ok(())
}

#[test]
fn missing_database_url_is_an_error() -> Result<()> {
    cargo_run!("cleanup").failure().stderr(predicate::str::contains("--database-url"));
    Ok(())
}

#[test]
fn analyze_rejects_conflicting_targets() -> Result<()> {
    // post 与 upload 互斥，同时给出应直接报错
    cargo_run!(
        "-d",
        "postgres://localhost/forum",
        "analyze",
        "--service-endpoint",
        "http://localhost:9000",
        "--post",
        "1",
        "--upload",
        "2"
    )
    .failure()
    .stderr(predicate::str::contains("--upload"));
    Ok(())
}
