use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use s3s2_core::options::{self, Options};

mod decrypt;
mod share;

#[derive(Parser)]
#[command(name = "s3s2", version, about = "Encrypted batch file transfer to S3 or GCS")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Zip, encrypt and upload a directory or file list
    Share(ShareArgs),
    /// Download, decrypt and inflate the files listed in a manifest
    Decrypt(DecryptArgs),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Share(args) => {
            init_tracing(args.debug);
            share::run(args.into_options()).await
        }
        Command::Decrypt(args) => {
            init_tracing(args.debug);
            decrypt::run(args.into_options()).await
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.to_string());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[derive(Args, Debug)]
struct ShareArgs {
    /// The directory to zip, encrypt and share
    #[arg(long)]
    directory: Option<PathBuf>,

    /// CSV index of source paths to share instead of a directory
    #[arg(long)]
    share_from_list: Option<PathBuf>,

    /// The org that owns the files; uppercased into every object key
    #[arg(long, required = true)]
    org: String,

    /// Batch-folder prefix; must contain an approved domain tag
    #[arg(long, default_value = "")]
    prefix: String,

    /// Target bucket
    #[arg(long, required = true)]
    bucket: String,

    /// Region for the object-store session
    #[arg(long, required = true)]
    region: String,

    /// Maximum number of files processed at a time within a chunk
    #[arg(long, default_value_t = 10)]
    parallelism: usize,

    /// Files per chunk; the manifest is rewritten and uploaded after each chunk
    #[arg(long, default_value_t = 10_000)]
    chunk_size: usize,

    /// Payload files per batch folder before rolling over to the next one
    #[arg(long, default_value_t = 100_000)]
    batch_size: usize,

    /// Emit the downstream trigger object at rollover and at the end
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    lambda_trigger: bool,

    /// Alternate location for .zip and .zip.gpg intermediates
    #[arg(long)]
    scratch_directory: Option<PathBuf>,

    /// If provided, processed sources are moved here after each chunk
    #[arg(long)]
    archive_directory: Option<PathBuf>,

    /// Comma-separated file names uploaded first into every batch folder and
    /// archived last
    #[arg(long, default_value = "")]
    metadata_files: String,

    /// Delete the source directory contents after a fully successful run
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    delete_on_completion: bool,

    /// KMS key id for object-store server-side encryption
    #[arg(long)]
    awskey: Option<String>,

    /// The receiver's public key; a local file path
    #[arg(long)]
    receiver_public_key: Option<PathBuf>,

    /// Secret-store entry holding the receiver's public key
    #[arg(long)]
    ssm_public_key: Option<String>,

    /// Use the GCS backend instead of S3
    #[arg(long, default_value_t = false)]
    is_gcs: bool,

    /// Role to assume via federated identity for credential refresh
    #[arg(long)]
    aws_role_arn: Option<String>,

    /// Named credential profile for the session
    #[arg(long)]
    aws_profile: Option<String>,

    /// Comma-separated approved domain tags for --prefix
    #[arg(long, default_value = "clinical,documents,imaging,molecular")]
    prefix_tags: String,

    /// Log at debug level
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl ShareArgs {
    fn into_options(self) -> Options {
        Options {
            directory: self.directory,
            share_from_list: self.share_from_list,
            org: self.org,
            prefix: self.prefix,
            bucket: self.bucket,
            region: self.region,
            parallelism: self.parallelism,
            chunk_size: self.chunk_size,
            batch_size: self.batch_size,
            lambda_trigger: self.lambda_trigger,
            scratch_directory: self.scratch_directory,
            archive_directory: self.archive_directory,
            metadata_files: options::parse_list(&self.metadata_files),
            delete_on_completion: self.delete_on_completion,
            aws_key: self.awskey,
            pub_key: self.receiver_public_key,
            ssm_pub_key: self.ssm_public_key,
            is_gcs: self.is_gcs,
            aws_role_arn: self.aws_role_arn,
            aws_profile: self.aws_profile,
            prefix_tags: options::parse_list(&self.prefix_tags),
            ..Default::default()
        }
    }
}

#[derive(Args, Debug)]
struct DecryptArgs {
    /// Target bucket
    #[arg(long, required = true)]
    bucket: String,

    /// Manifest object key within the bucket (without the org segment)
    #[arg(long, required = true)]
    file: String,

    /// Local destination for downloaded and restored files
    #[arg(long, required = true)]
    directory: PathBuf,

    /// The org that owns the files
    #[arg(long, required = true)]
    org: String,

    /// Region for the object-store session
    #[arg(long, required = true)]
    region: String,

    /// Named credential profile for the session
    #[arg(long)]
    aws_profile: Option<String>,

    /// The receiver's public key; a local file path
    #[arg(long)]
    receiver_public_key: Option<PathBuf>,

    /// The receiver's private key; a local file path
    #[arg(long)]
    private_key: Option<PathBuf>,

    /// Secret-store entry holding the public key
    #[arg(long)]
    ssm_public_key: Option<String>,

    /// Secret-store entry holding the private key
    #[arg(long)]
    ssm_private_key: Option<String>,

    /// Use the GCS backend instead of S3
    #[arg(long, default_value_t = false)]
    is_gcs: bool,

    /// Maximum number of files downloaded and decrypted at a time
    #[arg(long, default_value_t = 10)]
    parallelism: usize,

    /// Comma-separated wildcard patterns; only matching manifest entries are
    /// restored
    #[arg(long)]
    filter_files: Option<String>,

    /// Log at debug level
    #[arg(long, default_value_t = false)]
    debug: bool,
}

impl DecryptArgs {
    fn into_options(self) -> Options {
        Options {
            bucket: self.bucket,
            file: self.file,
            directory: Some(self.directory),
            org: self.org,
            region: self.region,
            aws_profile: self.aws_profile,
            pub_key: self.receiver_public_key,
            priv_key: self.private_key,
            ssm_pub_key: self.ssm_public_key,
            ssm_priv_key: self.ssm_private_key,
            is_gcs: self.is_gcs,
            parallelism: self.parallelism,
            filter_files: self.filter_files,
            ..Default::default()
        }
    }
}
