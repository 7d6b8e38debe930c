use crate::common::*;
use crate::gene_model::GeneModelResult;

use mcmc_util::chain::quantile_inplace;
use plotters::prelude::*;
use std::path::Path;

const PLOT_SIZE: (u32, u32) = (900, 600);
const GRID_SIZE: usize = 100;
const MAX_DRAWS: usize = 400;

fn artifact<E: std::fmt::Display>(e: E) -> LentilError {
    LentilError::Artifact(e.to_string())
}

/// Posterior median and 95% band of `mu` per grid point
fn mu_band(result: &GeneModelResult, grid: &[f32], batch: &str) -> Result<Vec<(f32, f32, f32)>> {
    let mu = result.posterior.predict_mu(grid, batch, Some(MAX_DRAWS))?;
    Ok((0..grid.len())
        .map(|j| {
            let mut col: Vec<f32> = mu.column(j).iter().copied().collect();
            let lo = quantile_inplace(&mut col, 0.025);
            let med = quantile_inplace(&mut col, 0.5);
            let hi = quantile_inplace(&mut col, 0.975);
            (med, lo, hi)
        })
        .collect())
}

/// Observed counts and fitted mean trajectories of one gene, one
/// color per batch, written as SVG
pub fn plot_gene_model(result: &GeneModelResult, output: &Path) -> Result<()> {
    let data = &result.dataset;
    if data.n_obs() == 0 {
        return Err(LentilError::Artifact(format!("{}: nothing to plot", result.gene)));
    }

    let x_max = data.x.iter().copied().fold(1.0f32, f32::max);
    let grid: Vec<f32> = (0..GRID_SIZE)
        .map(|i| 1. + (x_max - 1.) * i as f32 / (GRID_SIZE - 1) as f32)
        .collect();

    let bands = result
        .joined_by_array()
        .into_iter()
        .map(|(w, d)| {
            let band = mu_band(result, &grid, &w.array)?;
            let label = match d {
                Some(d) => format!(
                    "{} (shape {:.2}, var/mean {:.2})",
                    w.array, w.shape, d.overdispersion
                ),
                None => format!("{} (shape {:.2})", w.array, w.shape),
            };
            Ok((w.array.clone(), label, band))
        })
        .collect::<Result<Vec<_>>>()?;

    let y_obs_max = data.y.iter().copied().fold(0.0f32, f32::max);
    let y_fit_max = bands
        .iter()
        .flat_map(|(_, _, b)| b.iter().map(|v| v.2))
        .filter(|v| v.is_finite())
        .fold(0.0f32, f32::max);
    let y_max = (y_obs_max.max(y_fit_max) * 1.05).max(1.0);

    let root = SVGBackend::new(output, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(artifact)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(&*result.gene, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0f32..(x_max + 1.), 0.0f32..y_max)
        .map_err(artifact)?;

    chart
        .configure_mesh()
        .x_desc("pseudotime bin")
        .y_desc("expression")
        .draw()
        .map_err(artifact)?;

    for (i, (array, label, band)) in bands.iter().enumerate() {
        let color = Palette99::pick(i);

        let mut polygon: Vec<(f32, f32)> =
            grid.iter().zip(band.iter()).map(|(&x, b)| (x, b.1)).collect();
        polygon.extend(grid.iter().zip(band.iter()).rev().map(|(&x, b)| (x, b.2)));
        chart
            .draw_series(std::iter::once(Polygon::new(polygon, color.mix(0.15).filled())))
            .map_err(artifact)?;

        let points = data
            .x
            .iter()
            .zip(data.y.iter())
            .enumerate()
            .filter(|(k, _)| data.array(*k) == array.as_ref())
            .map(|(_, (&x, &y))| Circle::new((x, y), 3, color.mix(0.6).filled()));
        chart.draw_series(points).map_err(artifact)?;

        let curve: Vec<(f32, f32)> = grid.iter().zip(band.iter()).map(|(&x, b)| (x, b.0)).collect();
        let legend_color = color.to_rgba();
        chart
            .draw_series(LineSeries::new(curve, color.stroke_width(2)))
            .map_err(artifact)?
            .label(label.as_str())
            .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], legend_color));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()
        .map_err(artifact)?;

    root.present().map_err(artifact)?;
    Ok(())
}
