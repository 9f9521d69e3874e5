use anyhow::{Context, Result};
use apphost_config::{Config, EnvVars};
use comfy_table::{Cell, Color, Table};

pub fn run(config: &Config) -> Result<()> {
    let model = config
        .to_model_with(&EnvVars::from_process())
        .context("Failed to build app model")?;
    let plan = service_orchestration::plan(&model)?;

    let mut table = Table::new();
    table.set_header(vec!["BATCH", "RESOURCE", "KIND", "DEPENDS ON"]);

    for (index, batch) in plan.batches().iter().enumerate() {
        for name in batch {
            let Some(node) = model.resource(name) else {
                continue;
            };
            let producers = node.producers().join(", ");
            let producers = if producers.is_empty() { "-" } else { &producers };

            table.add_row(vec![
                Cell::new(index + 1).fg(Color::Cyan),
                Cell::new(name),
                Cell::new(node.kind().label()),
                Cell::new(producers),
            ]);
        }
    }

    println!("{}", table);
    println!(
        "{} resources in {} batches",
        plan.len(),
        plan.batches().len()
    );
    Ok(())
}
