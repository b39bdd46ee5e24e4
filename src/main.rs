use anyhow::Context;
use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    let ok = gatehouse::run().context("gatehouse failed")?;
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
