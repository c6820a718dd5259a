//! End-to-end editing scenarios

use kicad_sch::prelude::*;
use kicad_sch::{Element, LibraryConfig, Session};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

fn new_schematic(name: &str) -> Schematic {
    Schematic::with_library(name, Arc::new(SymbolLibrary::builtin()))
}

const TEST_POINT_LIBRARY: &str = r#"(kicad_symbol_lib
	(version 20231120)
	(generator "kicad_symbol_editor")
	(symbol "TestPoint"
		(in_bom yes)
		(on_board yes)
		(property "Reference" "TP"
			(at 0 2.54 0)
		)
		(property "Value" "TestPoint"
			(at 0 -2.54 0)
		)
		(symbol "TestPoint_0_1"
			(rectangle
				(start -1.27 1.27)
				(end 1.27 -1.27)
			)
		)
		(symbol "TestPoint_1_1"
			(pin passive line
				(at -5 0 0)
				(length 3.73)
				(name "P")
				(number "1")
			)
		)
	)
)
"#;

#[test]
fn test_references_stay_unique() {
    let mut sch = new_schematic("refs");
    sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
        .unwrap();
    let err = sch
        .add_component("Device:R", "R1", "22k", (120.0, 100.0), None)
        .unwrap_err();
    assert!(matches!(err, SchematicError::DuplicateReference(ref r) if r == "R1"));

    assert!(sch.remove_component("R1"));
    sch.add_component("Device:R", "R1", "22k", (120.0, 100.0), None)
        .unwrap();
    assert_eq!(sch.components().count(), 1);
    assert_eq!(sch.component("R1").unwrap().value, "22k");
}

#[test]
fn test_resistor_pins_under_rotation() {
    let expected = [
        (0.0, (100.0, 96.19), (100.0, 103.81)),
        (90.0, (103.81, 100.0), (96.19, 100.0)),
        (180.0, (100.0, 103.81), (100.0, 96.19)),
        (270.0, (96.19, 100.0), (103.81, 100.0)),
    ];

    for (rotation, pin1, pin2) in expected {
        let mut sch = new_schematic("rot");
        sch.add_component_with(
            NewComponent::new("Device:R", "R1", "10k", (100.0, 100.0)).rotation(rotation),
        )
        .unwrap();

        let p1 = sch.pin_position("R1", "1").unwrap();
        let p2 = sch.pin_position("R1", "2").unwrap();
        assert!(p1.coincides(&pin1.into()), "pin 1 at {}: {:?}", rotation, p1);
        assert!(p2.coincides(&pin2.into()), "pin 2 at {}: {:?}", rotation, p2);
    }
}

#[test]
fn test_symbol_from_library_directory() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("Custom.kicad_sym"), TEST_POINT_LIBRARY).unwrap();
    let library = Arc::new(SymbolLibrary::from_config(&LibraryConfig {
        symbol_dirs: vec![dir.path().to_path_buf()],
        include_builtin: true,
    }));

    let expected = [
        (0.0, (95.0, 100.0)),
        (90.0, (100.0, 95.0)),
        (180.0, (105.0, 100.0)),
        (270.0, (100.0, 105.0)),
    ];
    for (rotation, pin) in expected {
        let mut sch = Schematic::with_library("test_point", Arc::clone(&library));
        sch.add_component_with(
            NewComponent::new("Custom:TestPoint", "TP1", "TestPoint", (100.0, 100.0)).rotation(rotation),
        )
        .unwrap();
        let actual = sch.pin_position("TP1", "1").unwrap();
        assert!(actual.coincides(&pin.into()), "at {}: {:?}", rotation, actual);
    }

    // Built-in symbols are still reachable behind the directory.
    assert!(library.resolve("Device:R").is_some());
    assert!(library.resolve("Custom:Missing").is_none());
}

#[test]
fn test_connect_pins_with_labels() {
    let mut sch = new_schematic("rc");
    sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
        .unwrap();
    sch.add_component("Device:C", "C1", "100n", (120.0, 100.0), None)
        .unwrap();

    let [a, b] = sch
        .connect_pins_with_labels("R1", "2", "C1", "1", "VOUT")
        .unwrap();
    let label_a = sch.label(&a).unwrap();
    let label_b = sch.label(&b).unwrap();
    assert_eq!(label_a.text, "VOUT");
    assert_eq!(label_b.text, "VOUT");
    assert!(label_a.position.coincides(&sch.pin_position("R1", "2").unwrap()));
    assert!(label_b.position.coincides(&sch.pin_position("C1", "1").unwrap()));

    let vout = sch.nets().into_iter().find(|n| n.name == "VOUT").unwrap();
    assert_eq!(vout.pins.len(), 2);
    assert_eq!(vout.labels.len(), 2);

    let dangling: Vec<String> = sch
        .validate()
        .into_iter()
        .filter(|i| i.rule_id == "dangling_pin")
        .map(|i| i.message)
        .collect();
    assert_eq!(dangling.len(), 2);
    assert!(dangling.contains(&"Pin 1 of R1 is not connected".to_string()));
    assert!(dangling.contains(&"Pin 2 of C1 is not connected".to_string()));
}

#[test]
fn test_bulk_update_by_lib_id() {
    let mut sch = new_schematic("bulk");
    sch.add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
        .unwrap();
    sch.add_component("Device:R", "R2", "10k", (120.0, 100.0), None)
        .unwrap();
    sch.add_component("Device:C", "C1", "100n", (140.0, 100.0), None)
        .unwrap();

    let criteria = ComponentCriteria::default().lib_id("Device:R");
    let update = ComponentUpdate {
        footprint: Some("Resistor_SMD:R_0402_1005Metric".to_string()),
        ..Default::default()
    };
    assert_eq!(sch.bulk_update(&criteria, &update).unwrap(), 2);
    assert_eq!(sch.bulk_update(&criteria, &update).unwrap(), 0);

    assert_eq!(
        sch.component("R2").unwrap().footprint,
        "Resistor_SMD:R_0402_1005Metric"
    );
    assert_eq!(sch.component("C1").unwrap().footprint, "");
    assert!(sch.to_text().contains("(property \"Footprint\" \"Resistor_SMD:R_0402_1005Metric\""));
}

#[test]
fn test_area_query_includes_touching_components() {
    let mut sch = new_schematic("area");
    let r1 = sch
        .add_component("Device:R", "R1", "10k", (100.0, 100.0), None)
        .unwrap();
    sch.add_component("Device:R", "R2", "10k", (100.0, 150.0), None)
        .unwrap();

    // R1's lower pin ends exactly on the area's top edge.
    let edge = 100.0 + 3.81;
    assert_eq!(sch.in_area(90.0, edge, 110.0, 120.0), vec![r1.clone()]);
    assert_eq!(sch.in_area(110.0, 120.0, 90.0, edge), vec![r1]);
    assert!(sch.in_area(90.0, edge + 0.01, 110.0, 120.0).is_empty());
}

#[test]
fn test_clone_is_independent() {
    let dir = TempDir::new().unwrap();
    let original = Schematic::load_with_library(
        fixture_path("divider.kicad_sch"),
        Arc::new(SymbolLibrary::builtin()),
    )
    .unwrap();

    let mut copy = original.clone_as("divider_copy");
    copy.set_component_value("R1", "12k").unwrap();
    copy.save_as(dir.path().join("divider_copy.kicad_sch"))
        .unwrap();

    assert_eq!(original.component("R1").unwrap().value, "10k");
    assert_eq!(original.file_path(), Some(fixture_path("divider.kicad_sch").as_path()));

    let reloaded = Schematic::load_with_library(
        dir.path().join("divider_copy.kicad_sch"),
        Arc::new(SymbolLibrary::builtin()),
    )
    .unwrap();
    assert_eq!(reloaded.component("R1").unwrap().value, "12k");
    assert_eq!(reloaded.project(), "divider_copy");
    assert_eq!(reloaded.title(), Some("divider_copy"));

    let before: HashSet<&str> = original.elements().iter().filter_map(Element::uuid).collect();
    let after: HashSet<&str> = reloaded.elements().iter().filter_map(Element::uuid).collect();
    assert!(before.is_disjoint(&after));
    assert!(reloaded.validate().is_empty());
}

#[test]
fn test_session_round_trip_through_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.kicad_sch");
    let mut session = Session::new(Arc::new(SymbolLibrary::builtin()));

    let requests = [
        r#"{"tool": "create_schematic", "arguments": {"name": "session"}}"#.to_string(),
        r#"{"tool": "add_component", "arguments": {"lib_id": "Device:R", "reference": "R1", "value": "10k", "position": [100, 100]}}"#.to_string(),
        r#"{"tool": "add_component", "arguments": {"lib_id": "Device:R", "reference": "R2", "value": "10k", "position": [130, 100], "rotation": 90}}"#.to_string(),
        r#"{"tool": "connect_pins_with_labels", "arguments": {"comp1_ref": "R1", "pin1": "2", "comp2_ref": "R2", "pin2": "1", "net_name": "MID"}}"#.to_string(),
        serde_json::json!({"tool": "save_schematic", "arguments": {"file_path": path}}).to_string(),
    ];
    for request in &requests {
        let response = session.execute_json(request);
        assert_eq!(response["success"], true, "{} -> {}", request, response);
    }

    let mut reopened = Session::new(Arc::new(SymbolLibrary::builtin()));
    let loaded = reopened.execute_json(
        &serde_json::json!({"tool": "load_schematic", "arguments": {"file_path": path}}).to_string(),
    );
    assert_eq!(loaded["result"]["name"], "session");

    let nets = reopened.execute_json(r#"{"tool": "list_nets", "arguments": {}}"#);
    let names: Vec<&str> = nets["result"]["nets"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|n| n["name"].as_str())
        .collect();
    assert!(names.contains(&"MID"));

    let pins = reopened.execute_json(
        r#"{"tool": "list_component_pins", "arguments": {"reference": "R2"}}"#,
    );
    assert_eq!(pins["result"]["pins"].as_array().unwrap().len(), 2);
}

fn dual_opamp() -> Schematic {
    Schematic::load_with_library(
        fixture_path("dual_opamp.kicad_sch"),
        Arc::new(SymbolLibrary::builtin()),
    )
    .expect("Should parse")
}

#[test]
fn test_multi_unit_part_edits_every_unit() {
    let mut sch = dual_opamp();
    assert_eq!(sch.units("U1").count(), 2);

    let criteria = ComponentCriteria::default().lib_id("Amp:DUAL");
    assert_eq!(sch.filter(&criteria).len(), 2);
    let update = ComponentUpdate {
        value: Some("LM358".to_string()),
        ..Default::default()
    };
    assert_eq!(sch.bulk_update(&criteria, &update).unwrap(), 2);
    assert!(sch.units("U1").all(|c| c.value == "LM358"));
    assert_eq!(sch.bulk_update(&criteria, &update).unwrap(), 0);

    sch.set_component_footprint("U1", "Package_DIP:DIP-8_W7.62mm")
        .unwrap();
    assert!(sch
        .units("U1")
        .all(|c| c.footprint == "Package_DIP:DIP-8_W7.62mm"));

    sch.rename_component("U1", "U7").unwrap();
    assert_eq!(sch.units("U1").count(), 0);
    assert_eq!(sch.units("U7").count(), 2);
    let text = sch.to_text();
    assert!(!text.contains("TL072"));
    assert_eq!(text.matches("(reference \"U7\")").count(), 2);

    assert!(sch.remove_component("U7"));
    assert_eq!(sch.components().count(), 0);
}

#[test]
fn test_multi_unit_pins_across_units() {
    let sch = dual_opamp();
    let pin3 = sch.pin_position("U1", "3").unwrap();
    assert!(pin3.coincides(&Position::new(122.38, 100.0)), "{:?}", pin3);
    let pin1 = sch.pin_position("U1", "1").unwrap();
    assert!(pin1.coincides(&Position::new(107.62, 100.0)), "{:?}", pin1);
    assert!(matches!(
        sch.pin_position("U1", "9"),
        Err(SchematicError::PinNotFound { .. })
    ));

    let numbers: Vec<String> = sch.list_pins("U1").unwrap().map(|p| p.number).collect();
    assert_eq!(numbers, vec!["1", "2", "3", "4"]);

    let label = {
        let mut sch = dual_opamp();
        let id = sch.add_label_to_pin("U1", "4", "OUT_B").unwrap();
        sch.label(&id).unwrap().position
    };
    assert!(label.coincides(&Position::new(137.62, 100.0)));

    assert!(!sch
        .validate()
        .iter()
        .any(|i| i.rule_id == "duplicate_reference"));
}

#[test]
fn test_multi_unit_placement_moves_together() {
    let mut sch = dual_opamp();
    sch.rotate_component("U1", 90.0).unwrap();
    let pin1 = sch.pin_position("U1", "1").unwrap();
    assert!(pin1.coincides(&Position::new(100.0, 107.62)), "{:?}", pin1);
    let pin3 = sch.pin_position("U1", "3").unwrap();
    assert!(pin3.coincides(&Position::new(130.0, 92.38)), "{:?}", pin3);

    sch.move_component("U1", (110.0, 100.0)).unwrap();
    let positions: Vec<(u32, Position)> = sch.units("U1").map(|c| (c.unit, c.position())).collect();
    assert!(positions.contains(&(1, Position::new(110.0, 100.0))));
    assert!(positions.contains(&(2, Position::new(140.0, 100.0))));
}

#[test]
fn test_adding_units_of_a_placed_part() {
    let mut sch = dual_opamp();
    let err = sch
        .add_component_with(NewComponent::new("Amp:DUAL", "U1", "TL072", (160.0, 100.0)).unit(2))
        .unwrap_err();
    assert!(matches!(err, SchematicError::DuplicateReference(_)));

    let err = sch
        .add_component_with(NewComponent::new("Amp:DUAL", "U2", "TL072", (160.0, 100.0)).unit(3))
        .unwrap_err();
    assert!(matches!(err, SchematicError::InvalidArgument(_)));

    let err = sch
        .add_component("Device:R", "U1", "10k", (160.0, 100.0), None)
        .unwrap_err();
    assert!(matches!(err, SchematicError::DuplicateReference(_)));

    sch.add_component_with(NewComponent::new("Amp:DUAL", "U2", "TL072", (100.0, 150.0)).unit(1))
        .unwrap();
    sch.add_component_with(NewComponent::new("Amp:DUAL", "U2", "TL072", (130.0, 150.0)).unit(2))
        .unwrap();
    assert_eq!(sch.units("U2").count(), 2);
    let pin4 = sch.pin_position("U2", "4").unwrap();
    assert!(pin4.coincides(&Position::new(137.62, 150.0)), "{:?}", pin4);
}
