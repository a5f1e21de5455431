use clap::Parser;
use speech_pool_core::worker::{self, WorkerArgs};

fn main() -> anyhow::Result<()> {
    worker::run(WorkerArgs::parse())
}
