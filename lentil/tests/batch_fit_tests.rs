use lentil::batch_fit::*;
use lentil::common::*;
use lentil::gam_model::*;
use lentil::gene_model::{FitConfig, GeneDataset};
use lentil::metric_extract::extract_metric_matrix;
use lentil::metric_store::{MemoryMetricStore, MetricStore};
use lentil::tensor_builder::ExpressionTensor;
use lentil::LentilError;

use ndarray::Array3;
use tempfile::tempdir;

const POISON: f32 = 777.;

/// Returns a fixed posterior, failing on genes carrying `POISON`
struct MockEngine;

impl InferenceEngine for MockEngine {
    fn fit(
        &self,
        spec: &GamSpec,
        data: &GeneDataset,
        _: &ModelPriors,
        sampling: &SamplingConfig,
    ) -> anyhow::Result<GamPosterior> {
        if data.y.contains(&POISON) {
            anyhow::bail!("forced failure");
        }
        let design = GamDesign::new(spec, data)?;
        let n_params = design.n_params();
        let draws_per_chain = 20;
        let n = sampling.chains * draws_per_chain;
        let draws = Mat::from_fn(n, n_params, |i, k| 0.1 * k as f32 + 0.01 * (i % 7) as f32);
        Ok(GamPosterior {
            formula: spec.formula(),
            param_names: design.param_names(),
            n_chains: sampling.chains,
            draws_per_chain,
            draws,
            design,
        })
    }
}

fn toy_tensor(ngenes: usize, poisoned: Option<usize>) -> ExpressionTensor {
    let mut data = Array3::<f32>::from_shape_fn((2, 10, ngenes), |(b, t, g)| {
        (5 + b * 3 + (t % 4) + g) as f32
    });
    data[[1, 9, 0]] = f32::NAN;
    if let Some(g) = poisoned {
        for b in 0..2 {
            for t in 0..10 {
                data[[b, t, g]] = POISON;
            }
        }
    }
    ExpressionTensor {
        data,
        batches: vec!["b1".into(), "b2".into()],
        genes: (1..=ngenes).map(|g| format!("gene{}", g).into()).collect(),
    }
}

fn small_config() -> FitConfig {
    FitConfig {
        n_samples: 40,
        chains: 2,
        ..FitConfig::default()
    }
}

#[test]
fn one_failure_leaves_the_rest() -> anyhow::Result<()> {
    let tensor = toy_tensor(5, Some(2));

    for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel { num_workers: 2 }] {
        let mut store = MemoryMetricStore::new();
        let out = run_gene_models_with_store(
            &tensor,
            None,
            &MockEngine,
            &small_config(),
            mode,
            &PersistConfig::default(),
            &mut store,
        )?;

        assert_eq!(out.len(), 5);
        assert_eq!(out.num_succeeded(), 4);
        assert_eq!(out.failed_genes(), vec![Box::<str>::from("gene3")]);

        let order: Vec<&str> = out.results.iter().map(|(g, _)| g.as_ref()).collect();
        assert_eq!(order, vec!["gene1", "gene2", "gene3", "gene4", "gene5"]);

        let stored = store.list_groups(ARRAY_WEIGHTS_GROUP)?;
        assert_eq!(stored.len(), 4);
        assert!(!store.path_exists("array_weights/gene3"));
        assert_eq!(
            store.read_strings("array_weights/gene1/array")?,
            vec![Box::<str>::from("b1"), Box::from("b2")]
        );
    }
    Ok(())
}

#[test]
fn weights_follow_the_shape_posterior() -> anyhow::Result<()> {
    let tensor = toy_tensor(1, None);
    let out = run_gene_models(
        &tensor,
        Some(&[0][..]),
        &MockEngine,
        &small_config(),
        ExecutionMode::Sequential,
        &PersistConfig::default(),
    )?;

    let result = out.get("gene1").expect("gene1 fitted");
    let rows = &result.array_weights.rows;
    assert_eq!(rows.len(), 2);
    for r in rows.iter() {
        assert!((r.shape - r.estimate.exp()).abs() < 1e-4);
        assert_eq!(r.weight, r.shape);
        assert!(r.weight_norm > 0. && r.weight_norm <= 1.);
    }
    assert!(rows.iter().any(|r| (r.weight_norm - 1.).abs() < 1e-6));

    for (w, d) in result.joined_by_array() {
        let d = d.expect("diagnostics of every fitted batch");
        assert_eq!(w.array, d.array);
    }
    assert_eq!(result.diagnostics[1].n_obs, 9);
    Ok(())
}

#[test]
fn artifacts_are_written_per_gene() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let persist = PersistConfig {
        store_file: Some(dir.path().join("fit.h5")),
        plot_dir: Some(dir.path().join("plots")),
        model_dir: Some(dir.path().join("models")),
    };
    let tensor = toy_tensor(3, Some(1));

    let out = run_gene_models(
        &tensor,
        None,
        &MockEngine,
        &small_config(),
        ExecutionMode::Parallel { num_workers: 2 },
        &persist,
    )?;
    assert_eq!(out.num_succeeded(), 2);

    for gene in ["gene1", "gene3"] {
        assert!(dir.path().join("plots").join(format!("{}.svg", gene)).exists());
        let model_file = dir.path().join("models").join(format!("{}.model.json", gene));
        let json = std::fs::read_to_string(model_file)?;
        let value: serde_json::Value = serde_json::from_str(&json)?;
        assert_eq!(value["gene"], gene);
    }
    assert!(!dir.path().join("models").join("gene2.model.json").exists());
    Ok(())
}

#[test]
fn bad_gene_index_is_rejected_before_fitting() {
    let tensor = toy_tensor(2, None);
    let res = run_gene_models(
        &tensor,
        Some(&[0, 5][..]),
        &MockEngine,
        &small_config(),
        ExecutionMode::Sequential,
        &PersistConfig::default(),
    );
    assert!(matches!(res, Err(LentilError::DataShape(_))));
}

#[test]
fn zero_workers_is_a_configuration_error() {
    let tensor = toy_tensor(2, None);
    let res = run_gene_models(
        &tensor,
        None,
        &MockEngine,
        &small_config(),
        ExecutionMode::Parallel { num_workers: 0 },
        &PersistConfig::default(),
    );
    assert!(matches!(res, Err(LentilError::Configuration(_))));
}

#[test]
fn slash_in_a_gene_name_does_not_stop_the_batch() -> anyhow::Result<()> {
    let mut tensor = toy_tensor(3, None);
    tensor.genes[1] = "HLA-A/B".into();

    for mode in [ExecutionMode::Sequential, ExecutionMode::Parallel { num_workers: 2 }] {
        let mut store = MemoryMetricStore::new();
        let out = run_gene_models_with_store(
            &tensor,
            None,
            &MockEngine,
            &small_config(),
            mode,
            &PersistConfig::default(),
            &mut store,
        )?;
        assert_eq!(out.num_succeeded(), 3);
        assert_eq!(store.list_groups(ARRAY_WEIGHTS_GROUP)?.len(), 3);

        let mat = extract_metric_matrix(&store, "Estimate")?;
        assert_eq!(mat.n_genes(), 3);
        assert!(mat.genes.iter().any(|g| g.as_ref() == "HLA-A/B"));
        assert!(mat.skipped.is_empty());
    }
    Ok(())
}
