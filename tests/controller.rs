//! Controller integration tests, using memory outputs as observable pins.

use std::time::Duration;

use woodpeckers::{BirdSpec, Config, Controller, ControllerError, Settings};

fn bird(statics: &[&str], backs: &[&str], forwards: &[&str]) -> BirdSpec {
    BirdSpec {
        name: "Woody".to_string(),
        statics: statics.iter().map(|s| s.to_string()).collect(),
        backs: backs.iter().map(|s| s.to_string()).collect(),
        forwards: forwards.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn builds_from_config() {
    let config = Config::from_yaml(concat!(
        "Outputs:\n",
        "  - Lamp:\n",
        "    Type: Memory\n",
        "Birds:\n",
        "  - Woody:\n",
        "    Static: [Lamp]\n",
    ))
    .unwrap();

    let controller = Controller::from_config(&config).unwrap();
    assert_eq!(controller.output_value("Lamp"), Some(false));
}

#[test]
fn rejects_duplicate_outputs() {
    let mut controller = Controller::new(Settings::default()).unwrap();
    controller.add_memory_output("Lamp").unwrap();
    assert!(matches!(
        controller.add_memory_output("Lamp"),
        Err(ControllerError::DuplicateOutput(_))
    ));
}

#[test]
fn rejects_birds_with_unknown_outputs() {
    let mut controller = Controller::new(Settings::default()).unwrap();
    controller.add_memory_output("Lamp").unwrap();

    let err = controller
        .add_bird(&bird(&["Lamp"], &["Missing"], &[]))
        .unwrap_err();
    assert!(matches!(err, ControllerError::UnknownOutput { .. }));
}

#[test]
fn set_up_drives_the_resting_pose() {
    let mut controller = Controller::new(Settings::default()).unwrap();
    controller.add_memory_output("Static").unwrap();
    controller.add_memory_output("Back").unwrap();
    controller.add_memory_output("Forward").unwrap();
    controller
        .add_bird(&bird(&["Static"], &["Back"], &["Forward"]))
        .unwrap();

    controller.set_up().unwrap();

    assert_eq!(controller.output_value("Static"), Some(true));
    assert_eq!(controller.output_value("Back"), Some(true));
    assert_eq!(controller.output_value("Forward"), Some(false));
}

#[test]
fn set_up_fails_when_an_output_cannot_be_acquired() {
    let mut controller = Controller::new(Settings::default()).unwrap();
    controller.add_gpio_output("Pin", 4).unwrap();

    assert!(matches!(
        controller.set_up(),
        Err(ControllerError::OutputSetUp(_, _))
    ));
}

#[test]
fn bounded_run_keeps_positions_consistent() {
    let settings = Settings {
        min_wait: 10,
        max_wait: 11,
        min_pecks: 1,
        max_pecks: 2,
        peck_wait: 10,
    };
    let mut controller = Controller::new(settings).unwrap();
    controller.add_memory_output("Back").unwrap();
    controller.add_memory_output("Forward").unwrap();
    controller
        .add_bird(&bird(&[], &["Back"], &["Forward"]))
        .unwrap();
    controller.set_up().unwrap();

    // Bound the run with a stop timer well past a few peck cycles.
    controller
        .reactor_mut()
        .add_timer(100, Duration::from_millis(300), |reactor, _| {
            reactor.stop();
        })
        .unwrap();

    controller.run().unwrap();

    // The two positions are always complementary, wherever the run stopped.
    let back = controller.output_value("Back").unwrap();
    let forward = controller.output_value("Forward").unwrap();
    assert_ne!(back, forward);

    controller.tear_down();
}
