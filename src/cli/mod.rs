pub mod analyze;
pub mod backfill;
pub mod cleanup;
pub mod serve;

pub use analyze::*;
pub use backfill::*;
pub use cleanup::*;
pub use serve::*;

use crate::config::Opts;

pub trait SubCommandExtend {
    fn run(&self, opts: &Opts) -> impl std::future::Future<Output = anyhow::Result<()>> + Send;
}
