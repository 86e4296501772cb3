use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mugshot_core::{Config, FaceInfo, ImageBuffer, RecognitionPipeline, TrainingCorpus};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "mugshot", about = "Face detection and recognition against a labeled corpus")]
struct Cli {
    /// TOML config file (MUGSHOT_* environment variables still apply on top)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the corpus directory and an empty metadata file
    Init,
    /// Print detected face boxes as JSON
    Detect {
        image: PathBuf,
    },
    /// Detect and identify faces
    Recognize {
        image: PathBuf,
        /// Write the annotated image here
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Label each detected face interactively and add it to the corpus
    Train {
        image: PathBuf,
    },
    /// Show the biographical record for a label
    Info {
        label: String,
    },
    /// Update the biographical record for a label
    SetInfo(SetInfoArgs),
    /// List labels with their image counts
    List,
}

#[derive(Args)]
struct SetInfoArgs {
    label: String,
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long)]
    age: Option<String>,
    #[arg(long)]
    sex: Option<String>,
    #[arg(long)]
    glasses: Option<String>,
    #[arg(long)]
    skin_color: Option<String>,
    #[arg(long)]
    beard: Option<String>,
    #[arg(long)]
    hair_size: Option<String>,
}

impl SetInfoArgs {
    /// Overwrite only the fields given on the command line.
    fn apply(self, info: &mut FaceInfo) {
        let updates = [
            (self.first_name, &mut info.first_name),
            (self.last_name, &mut info.last_name),
            (self.age, &mut info.age),
            (self.sex, &mut info.sex),
            (self.glasses, &mut info.glasses),
            (self.skin_color, &mut info.skin_color),
            (self.beard, &mut info.beard),
            (self.hair_size, &mut info.hair_size),
        ];
        for (value, slot) in updates {
            if let Some(v) = value {
                *slot = v;
            }
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command {
        Commands::Init => {
            TrainingCorpus::init(&config.corpus_dir, &config.metadata_file)?;
            println!(
                "Corpus ready: {} (metadata {})",
                config.corpus_dir.display(),
                config.metadata_file.display()
            );
        }
        Commands::Detect { image } => {
            let pipeline = open_pipeline(&config, &image)?;
            let boxes = pipeline
                .current_image()
                .map(|source| pipeline.detector().detect(source))
                .unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&boxes)?);
        }
        Commands::Recognize { image, output, json } => {
            let mut pipeline = open_pipeline(&config, &image)?;
            let summary = pipeline.recognize_faces()?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Faces detected: {}", summary.face_count);
                for (i, face) in summary.faces.iter().enumerate() {
                    let b = face.bbox;
                    let who = face.label.as_deref().unwrap_or("unknown");
                    match face.distance {
                        Some(d) => println!("  #{i} {}x{} at ({}, {}): {who} (distance {d:.1})", b.width, b.height, b.x, b.y),
                        None => println!("  #{i} {}x{} at ({}, {})", b.width, b.height, b.x, b.y),
                    }
                }
                if summary.face_count > 0 {
                    print_info(&summary.primary);
                }
            }

            if let Some(path) = output {
                if let Some(annotated) = pipeline.annotated_image() {
                    annotated
                        .save(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    tracing::info!(path = %path.display(), "annotated image written");
                }
            }
        }
        Commands::Train { image } => {
            let mut pipeline = open_pipeline(&config, &image)?;
            let faces = pipeline.detected_faces()?;
            if faces.is_empty() {
                println!("No faces detected in {}", image.display());
                return Ok(());
            }

            let stdin = std::io::stdin();
            let mut lines = stdin.lock().lines();
            let mut added = 0usize;
            for (i, face) in faces.iter().enumerate() {
                print!("Face {}/{} label (empty to skip): ", i + 1, faces.len());
                std::io::stdout().flush()?;
                let Some(line) = lines.next().transpose()? else {
                    break;
                };
                let label = line.trim();
                if label.is_empty() {
                    continue;
                }
                let path = pipeline.add_face(label, face)?;
                println!("  saved {}", path.display());
                added += 1;
            }

            if added > 0 {
                pipeline.corpus().save_metadata()?;
            }
            println!("Added {added} face(s)");
        }
        Commands::Info { label } => {
            let mut corpus = load_corpus(&config)?;
            print_info(corpus.get_or_create(&label));
        }
        Commands::SetInfo(args) => {
            let mut corpus = load_corpus(&config)?;
            let mut info = corpus.get_or_create(&args.label).clone();
            args.apply(&mut info);
            corpus.set_info(info.clone())?;
            corpus.save_metadata()?;
            print_info(&info);
        }
        Commands::List => {
            let corpus = load_corpus(&config)?;
            if corpus.infos().is_empty() {
                println!("Corpus is empty");
            }
            for label in corpus.labels() {
                println!("{label}: {} image(s)", corpus.count_label(label));
            }
        }
    }

    Ok(())
}

fn open_pipeline(config: &Config, image: &Path) -> Result<RecognitionPipeline> {
    let mut pipeline = RecognitionPipeline::from_config(config)?;
    let source = ImageBuffer::open(image).with_context(|| format!("failed to read {}", image.display()))?;
    pipeline.set_image(source);
    Ok(pipeline)
}

fn load_corpus(config: &Config) -> Result<TrainingCorpus> {
    TrainingCorpus::load(&config.corpus_dir, &config.metadata_file)
        .with_context(|| format!("failed to load corpus from {}", config.corpus_dir.display()))
}

fn print_info(info: &FaceInfo) {
    let or_dash = |s: &str| if s.is_empty() { "-".to_string() } else { s.to_string() };
    println!("Label:      {}", or_dash(&info.label));
    println!("Name:       {} {}", or_dash(&info.first_name), or_dash(&info.last_name));
    println!("Age:        {}", or_dash(&info.age));
    println!("Sex:        {}", or_dash(&info.sex));
    println!("Glasses:    {}", or_dash(&info.glasses));
    println!("Skin color: {}", or_dash(&info.skin_color));
    println!("Beard:      {}", or_dash(&info.beard));
    println!("Hair size:  {}", or_dash(&info.hair_size));
    if !info.has_details() {
        println!("(no details recorded; use `mugshot set-info {}`)", info.label);
    }
}
