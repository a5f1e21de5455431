fn main() -> anyhow::Result<()> {
    spctl::run()
}
