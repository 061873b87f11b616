use anyhow::{Context as _, Result};
use clap::{Args, Parser, Subcommand};
use llama_bridge::{Bridge, CandleEngine, ContextParams, Generation, Handle};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "llama-bridge")]
#[command(version)]
#[command(about = "Load a GGUF model, generate text and release it", long_about = None)]
struct Cli {
    /// Log at debug level and print generation stats
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a single completion
    Generate {
        #[command(flatten)]
        model: ModelArgs,
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Interactive session on one loaded model
    Run {
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print model metadata as JSON
    Info {
        #[command(flatten)]
        model: ModelArgs,
    },
}

#[derive(Args)]
struct ModelArgs {
    /// Path to a GGUF model file
    #[arg(short, long)]
    model: PathBuf,
    /// JSON options object, e.g. '{"num_ctx": 4096}'
    #[arg(long)]
    options: Option<String>,
    #[arg(short = 'n', long)]
    num_predict: Option<i32>,
    #[arg(short, long)]
    temperature: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    stop: Vec<String>,
    /// Never use a GPU
    #[arg(long)]
    cpu: bool,
}

impl ModelArgs {
    fn params(&self) -> Result<ContextParams> {
        let mut params = ContextParams::from_env();
        if let Some(json) = &self.options {
            params = params.with_json(json).context("parsing --options")?;
        }
        if let Some(n) = self.num_predict {
            params.num_predict = n;
        }
        if let Some(t) = self.temperature {
            params.temperature = t;
        }
        if let Some(seed) = self.seed {
            params.seed = seed;
        }
        if !self.stop.is_empty() {
            params.stop = self.stop.clone();
        }
        if self.cpu {
            params.use_gpu = false;
        }
        Ok(params)
    }
}

fn main() {
    let cli = Cli::parse();
    llama_bridge::logging::init_with_default(if cli.verbose { "debug" } else { "warn" });

    let bridge = Bridge::new(Arc::new(CandleEngine::new()));
    let result = match cli.command {
        Commands::Generate { model, prompt } => generate(&bridge, &model, &prompt.join(" "), cli.verbose),
        Commands::Run { model } => interactive_run(&bridge, &model, cli.verbose),
        Commands::Info { model } => info(&bridge, &model),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load(bridge: &Bridge, args: &ModelArgs, params: &ContextParams) -> Result<Handle> {
    Ok(bridge.initialize_model_with(&args.model, params)?)
}

fn generate(bridge: &Bridge, args: &ModelArgs, prompt: &str, verbose: bool) -> Result<()> {
    let handle = load(bridge, args, &args.params()?)?;
    let result = stream_to_stdout(bridge, handle, prompt);
    bridge.free_model(handle)?;

    let generation = result?;
    if verbose {
        print_stats(&generation);
    }
    Ok(())
}

fn info(bridge: &Bridge, args: &ModelArgs) -> Result<()> {
    let handle = load(bridge, args, &args.params()?)?;
    let meta = bridge.meta(handle);
    bridge.free_model(handle)?;

    println!("{}", serde_json::to_string_pretty(&meta?)?);
    Ok(())
}

fn interactive_run(bridge: &Bridge, args: &ModelArgs, verbose: bool) -> Result<()> {
    let mut params = args.params()?;
    let mut handle = load(bridge, args, &params)?;
    println!(">>> Loaded {} (handle {})", args.model.display(), handle);
    println!("Type /help for commands, /bye to quit");

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline(">>> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("Use /bye to exit");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                bridge.free_model(handle)?;
                return Err(e.into());
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        if let Some(command) = line.strip_prefix('/') {
            let parts: Vec<&str> = command.splitn(3, ' ').collect();
            match parts[0] {
                "bye" | "exit" | "quit" => break,
                "help" | "?" => print_help(),
                "show" => {
                    println!("{}", serde_json::to_string_pretty(&bridge.meta(handle)?)?);
                    println!("{}", serde_json::to_string_pretty(&params)?);
                }
                "set" if parts.len() == 3 => {
                    let mut updated = params.clone();
                    if let Err(e) = updated.set(parts[1], parts[2]) {
                        eprintln!("Error: {:#}", e);
                        continue;
                    }
                    // Parameters are fixed per context, so the model is reloaded.
                    match bridge.reload_with(handle, &updated) {
                        Ok(reloaded) => handle = reloaded,
                        Err(e) => {
                            eprintln!("Error: {:#}", e);
                            continue;
                        }
                    }
                    params = updated;
                    println!("Set {} = {} (handle {})", parts[1], parts[2], handle);
                }
                "set" => println!("Usage: /set <param> <value>"),
                other => println!("Unknown command /{}; try /help", other),
            }
            continue;
        }

        match stream_to_stdout(bridge, handle, line) {
            Ok(generation) if verbose => print_stats(&generation),
            Ok(_) => {}
            Err(e) => eprintln!("Error: {:#}", e),
        }
    }

    bridge.free_model(handle)?;
    Ok(())
}

fn stream_to_stdout(bridge: &Bridge, handle: Handle, prompt: &str) -> Result<Generation> {
    let mut stdout = io::stdout();
    let generation = bridge.generate_stream(handle, prompt, |piece| {
        print!("{}", piece);
        stdout.flush().is_ok()
    })?;
    println!();
    Ok(generation)
}

fn print_stats(generation: &Generation) {
    eprintln!(
        "prompt tokens: {}  generated: {}  stop: {:?}  {:.2?} ({:.1} tok/s)",
        generation.prompt_tokens,
        generation.generated_tokens,
        generation.stop_reason,
        generation.duration,
        generation.tokens_per_second()
    );
}

fn print_help() {
    println!("Commands:");
    println!("  /bye, /exit          Release the model and quit");
    println!("  /show                Show model metadata and parameters");
    println!("  /set <param> <val>   Set a parameter and reload, e.g. /set temperature 0.2");
    println!("  /?                   Show this help");
}
