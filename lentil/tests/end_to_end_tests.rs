use lentil::batch_fit::*;
use lentil::common::*;
use lentil::conservation::{calculate_conservation_from_store, ConservationConfig};
use lentil::ess_engine::EssEngine;
use lentil::gene_model::FitConfig;
use lentil::input::{read_trajectory_data, MetadataColumns};
use lentil::metric_store::{Hdf5MetricStore, MetricStore};
use lentil::simulate::{generate_trajectory_data, SimArgs};
use lentil::tensor_builder::{build_tensor, ExpressionTensor, TensorConfig};

use ndarray::Array3;
use tempfile::tempdir;

/// [2 batches x 10 bins x 3 genes]
fn small_tensor() -> ExpressionTensor {
    let data = Array3::<f32>::from_shape_fn((2, 10, 3), |(b, t, g)| {
        let wave = (t as f32 / 3.).sin() * 4.;
        let noise = if (t + b) % 3 == 0 { 3. } else { 0. };
        (8. + 2. * g as f32 + wave + noise * b as f32).round()
    });
    ExpressionTensor {
        data,
        batches: vec!["b1".into(), "b2".into()],
        genes: vec!["gene1".into(), "gene2".into(), "gene3".into()],
    }
}

#[test]
fn fit_persist_and_score() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store_file = dir.path().join("lentil.h5");
    let persist = PersistConfig {
        store_file: Some(store_file.clone()),
        plot_dir: None,
        model_dir: None,
    };
    // short chains; mixing is not under test here
    let config = FitConfig {
        n_samples: 200,
        chains: 2,
        allow_poor_mixing: true,
        ..FitConfig::default()
    };

    let tensor = small_tensor();
    let out = run_gene_models(
        &tensor,
        None,
        &EssEngine::default(),
        &config,
        ExecutionMode::Parallel { num_workers: 2 },
        &persist,
    )?;
    assert_eq!(out.num_succeeded(), 3);

    let result = out.get("gene1").expect("gene1");
    assert_eq!(result.posterior.n_draws(), 200);
    assert!(result.array_weights.rows.iter().all(|r| r.shape > 0.));

    let store = Hdf5MetricStore::open(&store_file)?;
    let metric_names: Vec<String> = store
        .read_strings(METRIC_NAMES_PATH)?
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(
        metric_names,
        vec!["Estimate", "Est.Error", "Q2.5", "Q97.5", "shape", "weight", "weight_norm"]
    );
    assert_eq!(
        store.read_strings("array_weights/gene1/array")?,
        vec![Box::<str>::from("b1"), Box::from("b2")]
    );
    assert_eq!(store.read_floats("array_weights/gene2/weight_norm")?.len(), 2);

    let records =
        calculate_conservation_from_store(&store, "Estimate", &ConservationConfig::default())?;
    assert_eq!(records.len(), 3);
    for r in records.iter() {
        assert!((0. ..=1.).contains(&r.conservation_score));
    }
    Ok(())
}

#[test]
fn simulated_files_build_a_tensor() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let prefix = dir.path().join("sim");
    let prefix = prefix.to_str().expect("utf-8 path");

    let args = SimArgs {
        genes: 8,
        batches: 3,
        cells_per_batch: 200,
        depth: 20.,
        ..SimArgs::default()
    };
    let files = generate_trajectory_data(&args, prefix)?;

    let data = read_trajectory_data(
        &files.mtx,
        &files.genes,
        &files.cells,
        &files.metadata,
        &MetadataColumns::default(),
    )?;
    assert_eq!(data.counts.nrows(), 8);
    assert_eq!(data.counts.ncols(), 600);
    assert_eq!(data.batches.len(), 600);

    let config = TensorConfig {
        n_bins: 10,
        ..TensorConfig::default()
    };
    let tensor = build_tensor(&data.counts, &data.genes, &data.pseudotime, &data.batches, &config)?;
    assert_eq!(tensor.n_batches(), 3);
    assert_eq!(tensor.n_bins(), 10);
    assert_eq!(tensor.n_genes(), 8);
    assert!(tensor.observed_fraction() > 0.9);
    Ok(())
}
