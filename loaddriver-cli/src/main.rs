use anyhow::Result;

fn main() -> Result<()> {
    loaddriver_cli::cli::execute()
}
