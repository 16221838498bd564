use std::{fs::File, io::Write};

use biascorr::{CorrectionConfig, CorrectionMode, MissingLayerPolicy, Model, testing};

#[test]
fn test_config_file() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, r#"{{ "mode": "parallel", "neval_batches": 3 }}"#)?;
    let config: CorrectionConfig = serde_json::from_reader(File::open(file.path())?)?;
    assert_eq!(config.mode, CorrectionMode::Parallel);
    assert_eq!(config.neval_batches, Some(3));
    assert_eq!(config.on_missing_layer, MissingLayerPolicy::Abort);
    Ok(())
}

#[test]
fn test_saved_model_keeps_its_behaviour() -> anyhow::Result<()> {
    let mut rng = testing::seeded_rng(11);
    let model = testing::linear_chain(&mut rng, &[3, 4, 2])?;
    let data = testing::calibration_set(&mut rng, 1, &[4, 3]);

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("model.json");
    serde_json::to_writer(File::create(&path)?, &model)?;
    let loaded: Model = serde_json::from_reader(File::open(&path)?)?;

    let names = |m: &Model| m.named_layers().into_iter().map(|(p, _)| p).collect::<Vec<_>>();
    assert_eq!(names(&loaded), names(&model));
    assert_eq!(loaded.forward(&data[0].0)?, model.forward(&data[0].0)?);
    Ok(())
}

/// Drops the last element of the first tensor found in `value`.
fn truncate_first_tensor(value: &mut serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(map) if map.contains_key("shape") => {
            match map.get_mut("data") {
                Some(serde_json::Value::Array(data)) => data.pop().is_some(),
                _ => false,
            }
        }
        serde_json::Value::Object(map) => map.values_mut().any(truncate_first_tensor),
        serde_json::Value::Array(items) => items.iter_mut().any(truncate_first_tensor),
        _ => false,
    }
}

#[test]
fn test_malformed_model_file_is_rejected() -> anyhow::Result<()> {
    let mut rng = testing::seeded_rng(12);
    let model = testing::conv_chain(&mut rng, &[3, 4], 2, 2)?;
    let mut json = serde_json::to_value(&model)?;
    assert!(serde_json::from_value::<Model>(json.clone()).is_ok());

    assert!(truncate_first_tensor(&mut json));
    let err = serde_json::from_value::<Model>(json).unwrap_err();
    assert!(err.to_string().contains("data length"), "{err}");
    Ok(())
}
