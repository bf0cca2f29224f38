use anyhow::{Context, Result, bail};
use clap::Parser;

use streetcull::cli::{Cli, Command, ProfileArgs, ProfileCommand, RunArgs, parse_layer_list};
use streetcull::driver;
use streetcull::profile::{JsonProfileStore, Profile, ProfileStore};
use streetcull::progress::IndicatifProgressSink;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log);

    match cli.command {
        Command::Run(args) => run(args),
        Command::Profile(args) => profile_command(args),
    }
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run(args: RunArgs) -> Result<()> {
    if args.output.exists() {
        bail!("output path {} already exists", args.output.display());
    }

    let profile = resolve_profile(&args)?;

    let progress = IndicatifProgressSink::new();
    let (_, summary) = driver::process(&args.input, &args.output, &profile, &progress, None)?;
    progress.finish();

    println!(
        "processed={} modified={} decode_failures={}",
        summary.processed, summary.modified, summary.decode_failures
    );
    Ok(())
}

fn resolve_profile(args: &RunArgs) -> Result<Profile> {
    if let Some(layers) = &args.profile_layers {
        return Ok(Profile {
            id: "inline".to_string(),
            name: "inline".to_string(),
            layers_to_keep: parse_layer_list(layers),
            is_default: false,
        });
    }

    let mut store = JsonProfileStore::open(&args.profile_store)
        .with_context(|| format!("opening profile store {}", args.profile_store.display()))?;
    store.ensure_valid_default()?;

    let profile = match &args.profile {
        Some(id) => store.get(id)?,
        None => store.get_default()?,
    };
    Ok(profile)
}

fn profile_command(args: ProfileArgs) -> Result<()> {
    let mut store = JsonProfileStore::open(&args.profile_store)
        .with_context(|| format!("opening profile store {}", args.profile_store.display()))?;
    store.ensure_valid_default()?;

    match args.command {
        ProfileCommand::List => {
            for profile in store.list() {
                println!(
                    "{}\t{}\t{}\t{}",
                    profile.id,
                    profile.name,
                    if profile.is_default { "default" } else { "" },
                    profile.layers_to_keep.len()
                );
            }
        }
        ProfileCommand::Show { id } => {
            let profile = store.get(&id)?;
            println!("{profile:#?}");
        }
        ProfileCommand::Create {
            id,
            name,
            layers,
            set_default,
        } => {
            store.insert(Profile {
                id,
                name,
                layers_to_keep: parse_layer_list(&layers),
                is_default: set_default,
            })?;
        }
        ProfileCommand::Update { id, name, layers } => {
            let mut profile = store.get(&id)?;
            if let Some(name) = name {
                profile.name = name;
            }
            if let Some(layers) = layers {
                profile.layers_to_keep = parse_layer_list(&layers);
            }
            store.update(profile)?;
        }
        ProfileCommand::Delete { id } => {
            store.delete(&id)?;
        }
        ProfileCommand::SetDefault { id } => {
            store.set_default(&id)?;
        }
    }
    Ok(())
}
