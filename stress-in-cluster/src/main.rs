fn main() -> anyhow::Result<()> {
    stress_in_cluster::cli::execute()
}
