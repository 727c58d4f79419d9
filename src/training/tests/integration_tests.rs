//! End-to-end integration tests for the training pipeline

use approx::assert_relative_eq;
use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use tempfile::TempDir;

use crate::config::{Config, ModelVariant};
use crate::models::create_model;
use crate::training::data::loaders::save_shard;
use crate::training::{CheckpointManager, MultiTaskTrainer, Phase, ResultStore};

use super::mock_data::create_mock_samples;
use super::test_utils::{
    create_test_config, create_test_device, create_test_trainer, setup_test_logging, tiny_system,
};

#[test]
fn test_full_training_loop() {
    setup_test_logging();
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path());
    config.run.model = ModelVariant::Bs2bt2Up;

    let mut trainer = create_test_trainer(config, 12, 8).unwrap();
    let result = trainer.train().unwrap();

    // result store persisted and readable
    assert!(result.results_path.exists());
    let stored = ResultStore::load(&result.results_path).unwrap();
    assert_eq!(stored.repetitions(), 2);
    assert_eq!(stored.epochs(), 3);
    for repetition in 0..2 {
        assert_eq!(stored.completed_epochs(repetition), 3);
        for epoch in 0..3 {
            assert_eq!(
                stored.metrics(Phase::Eval, repetition, epoch),
                trainer.results().metrics(Phase::Eval, repetition, epoch)
            );
            assert_eq!(
                stored.weights(repetition, epoch),
                trainer.results().weights(repetition, epoch)
            );
        }
    }

    // one checkpoint per repetition, at that repetition's best eval loss
    for (repetition, best) in result.best_checkpoints.iter().enumerate() {
        let path = best.as_ref().unwrap();
        assert!(path.exists());
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .ends_with(&format!("_v10ms_snr5dB_tt{}.safetensors", repetition)));

        let min_eval = (0..3)
            .map(|epoch| stored.metrics(Phase::Eval, repetition, epoch).combined_loss)
            .fold(f64::INFINITY, f64::min);
        assert_eq!(result.min_eval_losses[repetition], min_eval);

        let metadata = CheckpointManager::read_metadata(path).unwrap();
        assert_eq!(metadata.repetition, repetition);
        assert_eq!(metadata.model, ModelVariant::Bs2bt2Up);
        assert_relative_eq!(metadata.eval_loss, min_eval, max_relative = 1e-12);
    }
}

#[test]
fn test_checkpoint_restores_into_fresh_model() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path());
    config.training.repetitions = 1;
    config.training.epochs = 2;

    let mut trainer = create_test_trainer(config, 8, 4).unwrap();
    let result = trainer.train().unwrap();
    let path = result.best_checkpoints[0].clone().unwrap();

    let mut var_map = VarMap::new();
    let vb = VarBuilder::from_varmap(&var_map, DType::F32, &create_test_device());
    let _model = create_model(ModelVariant::Vanilla, &tiny_system(), 0.5, vb).unwrap();

    let metadata = CheckpointManager::load(&path, &mut var_map).unwrap();
    assert!(metadata.epoch < 2);
    assert_eq!(
        metadata.num_parameters,
        var_map.all_vars().iter().map(|v| v.elem_count()).sum::<usize>()
    );
}

#[test]
fn test_training_from_shards_on_disk() {
    let data_dir = TempDir::new().unwrap();
    let output_dir = TempDir::new().unwrap();

    let mut config = Config::default();
    config.run.model = ModelVariant::Vanilla;
    config.run.output_dir = output_dir.path().to_path_buf();
    config.run.train_data = Some(data_dir.path().join("train"));
    config.run.eval_data = Some(data_dir.path().join("eval.safetensors"));
    config.training.repetitions = 1;
    config.training.epochs = 1;
    config.training.batch_size = 2;

    let system = config.run.system();
    std::fs::create_dir_all(data_dir.path().join("train")).unwrap();
    save_shard(
        &create_mock_samples(2, &system, 0).unwrap(),
        data_dir.path().join("train").join("part0.safetensors"),
    )
    .unwrap();
    save_shard(
        &create_mock_samples(2, &system, 1).unwrap(),
        data_dir.path().join("eval.safetensors"),
    )
    .unwrap();

    let mut trainer = MultiTaskTrainer::from_config(config).unwrap();
    let result = trainer.train().unwrap();

    assert_eq!(result.total_steps, 1);
    assert!(output_dir.path().join("MTL_ldr_lr0.001.safetensors").exists());
    assert!(output_dir
        .path()
        .join("MTL_ldr_lr0.001_v10ms_snr5dB_tt0.safetensors")
        .exists());
}

#[test]
fn test_missing_dataset_is_reported() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(dir.path());
    config.run.data_root = dir.path().join("nowhere");
    assert!(MultiTaskTrainer::from_config(config).is_err());
}
