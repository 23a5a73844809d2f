use anyhow::Result;
use clap::Parser;
use imboard::cli::SubCommandExtend;
use imboard::config::{Opts, SubCommand};

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("imboard=info"));

    let opts = Opts::parse();
    match &opts.subcmd {
        SubCommand::Serve(cmd) => cmd.run(&opts).await,
        SubCommand::Backfill(cmd) => cmd.run(&opts).await,
        SubCommand::Cleanup(cmd) => cmd.run(&opts).await,
        SubCommand::Analyze(cmd) => cmd.run(&opts).await,
    }
}
