//! Configuration loader tests.

use woodpeckers::{Config, ConfigError, OutputKind};

#[test]
fn has_default_settings() {
    let config = Config::default();

    assert_eq!(config.settings.min_wait, 1000);
    assert_eq!(config.settings.max_wait, 4000);
    assert_eq!(config.settings.min_pecks, 1);
    assert_eq!(config.settings.max_pecks, 3);
    assert_eq!(config.settings.peck_wait, 500);
    assert!(config.outputs.is_empty());
    assert!(config.birds.is_empty());
}

#[test]
fn parses_nothing() {
    let config = Config::from_yaml("%YAML 1.2\n---\n").unwrap();
    assert_eq!(config.settings, Default::default());
}

#[test]
fn parses_settings() {
    let text = concat!(
        "%YAML 1.2\n",
        "---\n",
        "\n",
        "Settings:\n",
        "  MinWait: 2000\n",
        "  MaxWait: 5000\n",
        "  MinPecks: 2\n",
        "  MaxPecks: 4\n",
        "  PeckWait: 1000\n",
    );

    let config = Config::from_yaml(text).unwrap();
    assert_eq!(config.settings.min_wait, 2000);
    assert_eq!(config.settings.max_wait, 5000);
    assert_eq!(config.settings.min_pecks, 2);
    assert_eq!(config.settings.max_pecks, 4);
    assert_eq!(config.settings.peck_wait, 1000);
}

#[test]
fn partial_settings_fall_back_to_defaults() {
    let config = Config::from_yaml("Settings:\n  MinWait: 50\n").unwrap();
    assert_eq!(config.settings.min_wait, 50);
    assert_eq!(config.settings.max_wait, 4000);
}

#[test]
fn parses_outputs() {
    let text = concat!(
        "%YAML 1.2\n",
        "---\n",
        "\n",
        "Outputs:\n",
        "  - Memory Output:\n",
        "    Type: Memory\n",
        "  - File Output:\n",
        "    Type: File\n",
        "    Path: /path/to/output\n",
        "  - GPIO Output:\n",
        "    Type: GPIO\n",
        "    Pin: 42\n",
    );

    let config = Config::from_yaml(text).unwrap();
    assert_eq!(config.outputs.len(), 3);

    assert_eq!(config.outputs[0].name, "Memory Output");
    assert_eq!(config.outputs[0].kind, OutputKind::Memory);

    assert_eq!(config.outputs[1].name, "File Output");
    assert_eq!(
        config.outputs[1].kind,
        OutputKind::File {
            path: "/path/to/output".into()
        }
    );

    assert_eq!(config.outputs[2].name, "GPIO Output");
    assert_eq!(config.outputs[2].kind, OutputKind::Gpio { pin: 42 });
}

#[test]
fn parses_birds() {
    let text = concat!(
        "Outputs:\n",
        "  - Left:\n",
        "    Type: Memory\n",
        "  - Right:\n",
        "    Type: Memory\n",
        "Birds:\n",
        "  - Woody:\n",
        "    Static: [Left]\n",
        "    Back: [Right]\n",
        "    Forward: [Left, Right]\n",
    );

    let config = Config::from_yaml(text).unwrap();
    assert_eq!(config.birds.len(), 1);

    let bird = &config.birds[0];
    assert_eq!(bird.name, "Woody");
    assert_eq!(bird.statics, vec!["Left"]);
    assert_eq!(bird.backs, vec!["Right"]);
    assert_eq!(bird.forwards, vec!["Left", "Right"]);
}

#[test]
fn fails_to_parse_output_without_type() {
    let text = concat!("Outputs:\n", "  - Memory Output:\n");
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::MissingType { .. })
    ));
}

#[test]
fn fails_to_parse_output_with_unknown_type() {
    let text = concat!("Outputs:\n", "  - Memory Output:\n", "    Type: Blap\n");
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::UnknownType { .. })
    ));
}

#[test]
fn fails_to_parse_output_with_unknown_key() {
    let text = concat!(
        "Outputs:\n",
        "  - Memory Output:\n",
        "    Type: Memory\n",
        "    Foo: Bar\n",
    );
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::UnknownKey { .. })
    ));
}

#[test]
fn fails_to_parse_file_output_without_path() {
    let text = concat!("Outputs:\n", "  - File Output:\n", "    Type: File\n");
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::MissingKey { .. })
    ));
}

#[test]
fn fails_to_parse_gpio_output_without_pin() {
    let text = concat!("Outputs:\n", "  - GPIO Output:\n", "    Type: GPIO\n");
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::MissingKey { .. })
    ));
}

#[test]
fn fails_on_unknown_settings_key() {
    let text = "Settings:\n  Sleep: 5\n";
    assert!(Config::from_yaml(text).is_err());
}

#[test]
fn fails_on_unknown_section() {
    let text = "Fish:\n  - Trout\n";
    assert!(Config::from_yaml(text).is_err());
}

#[test]
fn fails_on_bird_with_unknown_key() {
    let text = concat!("Birds:\n", "  - Woody:\n", "    Sideways: [Left]\n");
    assert!(matches!(
        Config::from_yaml(text),
        Err(ConfigError::UnknownKey { .. })
    ));
}

#[test]
fn loads_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        concat!(
            "Settings:\n",
            "  MinWait: 10\n",
            "  MaxWait: 20\n",
            "Outputs:\n",
            "  - Lamp:\n",
            "    Type: Memory\n",
        ),
    )
    .unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.settings.min_wait, 10);
    assert_eq!(config.outputs.len(), 1);
}

#[test]
fn missing_file_is_an_error() {
    assert!(matches!(
        Config::from_file("/nonexistent/config.yaml"),
        Err(ConfigError::Io { .. })
    ));
}
