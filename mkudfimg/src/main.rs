use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use discfs::{FileTree, ImageBuilder, SECTOR_SIZE};
use discfs::udf::{UdfOptions, UdfWriter};
use tracing::{error, info};


#[derive(Parser)]
struct Args {
    /// The directory whose contents are placed on the image.
    pub source_dir: PathBuf,

    /// The image file to create.
    pub output_image: PathBuf,

    /// The volume label of the image.
    #[arg(long, default_value = "CDROM")]
    pub volume_label: String,

    /// Record the image creation time for all files instead of their own times.
    #[arg(long)]
    pub no_file_times: bool,

    /// Write the sector allocations of the image to this file as JSON.
    #[arg(long)]
    pub layout_json: Option<PathBuf>,
}


/// Removes an image whose build failed midway so that no truncated image is left behind.
fn discard_partial_image(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        error!("failed to remove partial image {}: {}", path.display(), e);
    }
}


fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut tree = FileTree::scan(&args.source_dir)
        .expect("failed to scan source directory");
    info!("{} files in {} directories", tree.file_count(), tree.dir_count() + 1);

    let options = UdfOptions {
        volume_identifier: args.volume_label.clone(),
        volume_set_identifier: args.volume_label.clone(),
        use_file_times: !args.no_file_times,
        ..UdfOptions::default()
    };

    let output_file = File::create(&args.output_image)
        .expect("failed to create output image");
    let mut builder = ImageBuilder::new(BufWriter::new(output_file));
    builder.add_writer(Box::new(UdfWriter::new(&options)));

    if let Err(e) = builder.build(&mut tree) {
        error!("failed to build image: {}", e);
        drop(builder);
        discard_partial_image(&args.output_image);
        return ExitCode::FAILURE;
    }
    info!(
        "wrote {} sectors ({} bytes) to {}",
        builder.position() / SECTOR_SIZE, builder.position(), args.output_image.display(),
    );

    if let Some(layout_json) = &args.layout_json {
        let layout_file = File::create(layout_json)
            .expect("failed to create layout file");
        serde_json::to_writer_pretty(BufWriter::new(layout_file), builder.sectors().allocations())
            .expect("failed to write layout");
    }
    ExitCode::SUCCESS
}
