fn main() -> anyhow::Result<()> {
    tripdesk::cli::run()
}
