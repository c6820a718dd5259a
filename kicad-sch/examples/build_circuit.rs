//! Build a small voltage divider, wire it up with labels and validate it.
//! Run with: cargo run --example build_circuit [output.kicad_sch]

use kicad_sch::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let output = std::env::args()
        .nth(1)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("divider.kicad_sch"));

    let mut sch = Schematic::new("divider");
    sch.add_component_with(
        NewComponent::new("Device:R", "R1", "10k", (100.33, 88.9))
            .footprint("Resistor_SMD:R_0603_1608Metric"),
    )?;
    sch.add_component_with(
        NewComponent::new("Device:R", "R2", "4k7", (100.33, 106.68))
            .footprint("Resistor_SMD:R_0603_1608Metric"),
    )?;
    sch.add_component("power:GND", "#PWR01", "GND", (120.65, 116.84), None)?;

    sch.add_label_to_pin("R1", "1", "VIN")?;
    sch.connect_pins_with_labels("R1", "2", "R2", "1", "VOUT")?;
    sch.connect_pins_with_labels("R2", "2", "#PWR01", "1", "GND")?;

    for pin in sch.list_pins("R2")? {
        println!(
            "R2.{} at ({:.2}, {:.2})",
            pin.number, pin.position.x, pin.position.y
        );
    }

    println!("Nets:");
    for net in sch.nets() {
        let pins: Vec<String> = net
            .pins
            .iter()
            .map(|p| format!("{}.{}", p.reference, p.pin))
            .collect();
        println!("  {}: {}", net.name, pins.join(", "));
    }

    let issues = sch.validate();
    println!("{} issue(s)", issues.len());
    for issue in &issues {
        println!("  [{:?}] {}", issue.severity, issue.message);
    }

    sch.save_as(&output)?;
    println!("Saved {}", output.display());
    Ok(())
}
