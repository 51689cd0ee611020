use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dicom_nifti_volume::{
    ConversionOptions, Dtype, SortBy, VolumeLoader, preview, write_nifti,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Convert the DICOM series of a directory into NIfTI volumes
#[derive(Debug, Parser)]
struct App {
    /// Directory holding the DICOM files
    input: PathBuf,

    /// Directory receiving one `.nii` file per series
    output: PathBuf,

    /// Output sample type (deduced from the slices by default)
    #[arg(long, value_enum)]
    dtype: Option<Dtype>,

    /// Order of single-frame slices
    #[arg(long, value_enum, default_value_t = SortBy::ImagePositionPatient)]
    sort_by: SortBy,

    /// Also write the middle slice of each volume as PNG
    #[arg(long)]
    preview: bool,
}

fn main() -> ExitCode {
    let App {
        input,
        output,
        dtype,
        sort_by,
        preview: write_preview,
    } = App::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let series = match VolumeLoader::scan_directory(&input) {
        Ok(series) => series,
        Err(e) => {
            error!("could not read {}: {e}", input.display());
            return ExitCode::FAILURE;
        }
    };
    info!("found {} series in {}", series.len(), input.display());

    if let Err(e) = fs::create_dir_all(&output) {
        error!("could not create {}: {e}", output.display());
        return ExitCode::FAILURE;
    }

    let options = ConversionOptions { dtype };
    let mut failures = 0;
    for (uid, result) in VolumeLoader::convert_series(&series, sort_by, &options) {
        let record = match result {
            Ok(record) => record,
            Err(_) => {
                failures += 1;
                continue;
            }
        };

        if write_preview {
            let path = output.join(format!("{uid}.png"));
            match preview::middle_slice(&record).map(|image| image.save(&path)) {
                Some(Ok(())) => info!("wrote {}", path.display()),
                Some(Err(e)) => error!("could not write {}: {e}", path.display()),
                None => info!("no preview for series {uid}"),
            }
        }

        let path = output.join(format!("{uid}.nii"));
        match write_nifti(&path, record) {
            Ok(()) => info!("wrote {}", path.display()),
            Err(e) => {
                error!("could not write {}: {e}", path.display());
                failures += 1;
            }
        }
    }

    if failures > 0 {
        error!("{failures} of {} series failed", series.len());
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
