//! Worker process executable with the built-in task registry

fn main() -> anyhow::Result<()> {
    multipool_execution::worker_main(multipool_execution::builtin_registry())
}
