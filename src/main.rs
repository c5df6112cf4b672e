use clap::{Parser, Subcommand};
use snapframe::capture::{CaptureOptions, Snapshotter};
use snapframe::config::{self, CaptureConfig};
use snapframe::fetch::HttpFetcher;
use snapframe::precache::PreCacheOptions;
use snapframe::{output, tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Flags that override `snapframe.toml` for a single capture.
#[derive(clap::Args, Clone, Default)]
struct CaptureArgs {
    /// Uniform output scale (wins over --width/--height)
    #[arg(long)]
    scale: Option<f64>,
    /// Output width in px
    #[arg(long)]
    width: Option<f64>,
    /// Output height in px
    #[arg(long)]
    height: Option<f64>,
    /// Proxy base URL for cross-origin resources that fail to load directly
    #[arg(long)]
    proxy: Option<String>,
    /// Base URL of the captured document
    #[arg(long)]
    origin: Option<String>,
    /// Inline the @font-face sources listed in the config
    #[arg(long)]
    embed_fonts: bool,
}

#[derive(Parser)]
#[command(name = "snapframe")]
#[command(about = "Capture element trees as self-contained SVG snapshots")]
#[command(long_about = "\
Capture element trees as self-contained SVG snapshots

Input is a JSON element tree: each element has a tag, attributes, the
computed style the host resolved for it, and an optional size.

  {
    \"tag\": \"div\",
    \"size\": { \"width\": 320, \"height\": 200 },
    \"computed\": { \"background-image\": \"url(bg.png)\" },
    \"children\": [
      { \"tag\": \"img\", \"attrs\": { \"src\": \"pic.png\" } },
      { \"text\": \"Caption\" }
    ]
  }

Every image, background layer and configured font is fetched once and
inlined as a data: URL. Assets that fail to load keep their original
reference and are listed in the summary.

Run 'snapframe gen-config' to generate a documented snapframe.toml.")]
#[command(version)]
struct Cli {
    /// Directory holding snapframe.toml
    #[arg(long, default_value = ".", global = true)]
    config_dir: PathBuf,

    /// Log plugin and resolver diagnostics
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Capture a tree into an SVG file
    Capture {
        /// JSON element tree
        tree: PathBuf,
        /// Output file (defaults to the tree path with an .svg extension)
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        args: CaptureArgs,
    },
    /// Resolve and cache a tree's assets without capturing it
    PreCache {
        /// JSON element tree
        tree: PathBuf,
        /// Clear the cache and exit
        #[arg(long)]
        reset: bool,
        /// Only warm base styles and fonts
        #[arg(long)]
        skip_inline: bool,
        #[command(flatten)]
        args: CaptureArgs,
    },
    /// Print a stock snapframe.toml with all options documented
    GenConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Command::Capture { tree, out, args } => {
            let config = effective_config(&cli.config_dir, &args, cli.debug)?;
            let root = tree::load_tree(&tree)?;
            let snapshotter = Snapshotter::new(Arc::new(HttpFetcher::from_config(&config.network)?));

            let snapshot = snapshotter.capture(&root, &CaptureOptions::new(config)).await?;

            let out = out.unwrap_or_else(|| tree.with_extension("svg"));
            if let Some(parent) = out.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&out, snapshot.svg()?).await?;
            output::print_capture_summary(&snapshot, Some(&out));
        }
        Command::PreCache {
            tree,
            reset,
            skip_inline,
            args,
        } => {
            let config = effective_config(&cli.config_dir, &args, cli.debug)?;
            let root = tree::load_tree(&tree)?;
            let snapshotter = Snapshotter::new(Arc::new(HttpFetcher::from_config(&config.network)?));

            let report = snapshotter
                .pre_cache(
                    &root,
                    &PreCacheOptions {
                        config,
                        reset,
                        skip_inline,
                    },
                )
                .await?;
            output::print_precache_summary(&report);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

fn init_logging(debug: bool) {
    let default = if debug { "snapframe=debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

/// Load `snapframe.toml` and apply command-line overrides on top.
fn effective_config(
    config_dir: &Path,
    args: &CaptureArgs,
    debug: bool,
) -> Result<CaptureConfig, config::ConfigError> {
    let mut config = config::load_config(config_dir)?;
    if args.scale.is_some() {
        config.scale = args.scale;
    }
    if args.width.is_some() {
        config.width = args.width;
    }
    if args.height.is_some() {
        config.height = args.height;
    }
    if let Some(proxy) = &args.proxy {
        config.network.proxy = Some(proxy.clone());
    }
    if let Some(origin) = &args.origin {
        config.network.document_origin = Some(origin.clone());
    }
    config.embed_fonts |= args.embed_fonts;
    config.debug |= debug;
    config.validate()?;
    Ok(config)
}
