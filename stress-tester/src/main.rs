fn main() -> anyhow::Result<()> {
    stress_tester::cli::execute()
}
