pub fn run() -> anyhow::Result<()> {
    println!("sandbox-operator {}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
