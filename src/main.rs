use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{middleware, web, App, HttpServer, ResponseError};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facembed::handler::{self, EmbeddingResponse, Outcome, RequestLimits};
use facembed::{config, EmbedError, FaceEmbedder, OrtEmbedder};
use log::{info, warn};

#[derive(Parser)]
#[command(name = "facembed")]
#[command(version, about = "Face embedding service - ArcFace vectors over HTTP")]
struct Cli {
    /// Config file (defaults to the compiled-in path)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the models and serve POST /api/generate_embedding
    Serve {
        /// Address to bind (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Embed a local image and print the JSON response
    Embed {
        /// Image file to embed
        image: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { bind, port } => {
            let mut cfg = cfg;
            if let Some(bind) = bind {
                cfg.bind = bind;
            }
            if let Some(port) = port {
                cfg.port = port;
            }
            serve(cfg)
        }
        Commands::Embed { image } => embed(&cfg, &image),
        Commands::Config => {
            print!("{}", config::render_config(&cfg)?);
            Ok(())
        }
    }
}

fn serve(cfg: config::Config) -> Result<()> {
    let embedder: Arc<dyn FaceEmbedder> =
        Arc::new(OrtEmbedder::from_config(&cfg).context("Failed to initialize face embedder")?);
    let embedder = web::Data::from(embedder);
    let limits = web::Data::new(RequestLimits {
        max_body_bytes: cfg.max_body_bytes,
    });

    info!("Listening on {}:{}", cfg.bind, cfg.port);

    actix_web::rt::System::new().block_on(async move {
        let mut server = HttpServer::new(move || {
            App::new()
                .app_data(embedder.clone())
                .app_data(limits.clone())
                .wrap(middleware::Logger::default())
                .configure(handler::configure)
        });
        if cfg.workers > 0 {
            server = server.workers(cfg.workers);
        }

        server
            .bind((cfg.bind.as_str(), cfg.port))
            .with_context(|| format!("binding {}:{}", cfg.bind, cfg.port))?
            .run()
            .await
            .context("running HTTP server")
    })
}

fn embed(cfg: &config::Config, path: &std::path::Path) -> Result<()> {
    let embedder = OrtEmbedder::from_config(cfg).context("Failed to initialize face embedder")?;

    let result = image::open(path)
        .with_context(|| format!("opening {}", path.display()))
        .map_err(EmbedError::from)
        .and_then(|img| {
            let img = image::DynamicImage::ImageRgb8(img.into_rgb8());
            handler::embed_image(&embedder, &img)
        })
        .and_then(|outcome| match outcome {
            Outcome::Detected(embedding) => Ok(embedding),
            Outcome::NoFaceDetected => Err(EmbedError::NoFaceDetected),
        });

    let body = match result {
        Ok(embedding) => {
            info!("✓ {}-dimensional embedding for {}", embedding.len(), path.display());
            serde_json::to_string(&EmbeddingResponse { embedding })?
        }
        Err(err) => {
            warn!("{} -> {}", path.display(), err.status_code());
            serde_json::json!({ "error": err.to_string() }).to_string()
        }
    };
    println!("{body}");
    Ok(())
}
