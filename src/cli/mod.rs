//! CV-070: CLI subcommands: plan, apply, validate, fmt, graph, healthcheck, keystore.
//!
//! Every command returns the process exit code. Errors carry their own code
//! through [`Error::exit_code`].

pub mod report;

use crate::core::config::EngineConfig;
use crate::core::engine::Engine;
use crate::core::error::{Error, Result};
use crate::core::executor::{Mode, Summary};
use crate::core::health;
use crate::core::parser;
use crate::core::types::HealthLevel;
use crate::graph::CancelToken;
use crate::keystore::Keystore;
use clap::{ArgAction, Args, Subcommand, ValueEnum};
use indexmap::IndexMap;
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Flags shared by every subcommand. Set flags override the config file.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Worker threads for graph walks
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Require a verified signature for every module, local ones included
    #[arg(long, global = true)]
    pub verify_modules: bool,

    #[arg(long, global = true, value_name = "DIR")]
    pub keystore_system: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    pub keystore_user: Option<PathBuf>,

    #[arg(long, global = true, value_name = "DIR")]
    pub keystore_local: Option<PathBuf>,

    /// Root module parameter (repeatable)
    #[arg(short = 'p', long = "param", global = true, value_name = "NAME=VALUE", value_parser = parse_param)]
    pub params: Vec<(String, String)>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a module and show the changes an apply would make
    Plan {
        /// Module path or URL
        module: String,
    },

    /// Converge the system to the module's desired state
    Apply {
        /// Module path or URL
        module: String,
    },

    /// Parse, expand and validate a module without running anything
    Validate {
        /// Module path or URL
        module: String,
    },

    /// Re-emit a module file in canonical layout
    Fmt {
        file: PathBuf,

        /// Rewrite the file in place
        #[arg(short, long)]
        write: bool,

        /// Exit 1 when the file is not canonically formatted
        #[arg(long, conflicts_with = "write")]
        check: bool,
    },

    /// Export the loaded graph
    Graph {
        /// Module path or URL
        module: String,

        #[arg(long, value_enum, default_value_t = GraphFormat::Dot)]
        format: GraphFormat,
    },

    /// Plan, then report the health of every vertex
    Healthcheck {
        /// Module path or URL
        module: String,
    },

    /// Manage trusted signing keys
    Keystore {
        #[command(subcommand)]
        action: KeystoreCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeystoreCommand {
    /// Trust an armored public key (stored in the user layer)
    Add { file: PathBuf },

    /// Remove a key from the user layer
    Delete { fingerprint: String },

    /// Disable a system key for this user
    Mask { fingerprint: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Dot,
    Jsonl,
}

/// Parse `NAME=VALUE`. Names follow identifier rules; the value may be empty.
fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    let pattern = Regex::new(r"^([A-Za-z_][A-Za-z0-9_-]*)=(.*)$").map_err(|e| e.to_string())?;
    let caps = pattern
        .captures(raw)
        .ok_or_else(|| format!("expected NAME=VALUE, got {:?}", raw))?;
    Ok((caps[1].to_string(), caps[2].to_string()))
}

/// Resolve the engine configuration: file (when given), then flag overrides.
pub fn engine_config(global: &GlobalArgs) -> Result<EngineConfig> {
    let mut config = match &global.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(workers) = global.workers {
        config.workers = workers;
    }
    if global.verify_modules {
        config.verify_modules = true;
    }
    if let Some(dir) = &global.keystore_system {
        config.keystore.system.clone_from(dir);
    }
    if let Some(dir) = &global.keystore_user {
        config.keystore.user.clone_from(dir);
    }
    if let Some(dir) = &global.keystore_local {
        config.keystore.local.clone_from(dir);
    }
    config.validate()?;
    Ok(config)
}

fn module_args(global: &GlobalArgs) -> IndexMap<String, String> {
    global.params.iter().cloned().collect()
}

/// Dispatch a CLI command and return the process exit code.
pub fn dispatch(global: &GlobalArgs, cmd: Commands) -> Result<i32> {
    let config = engine_config(global)?;
    let args = module_args(global);
    match cmd {
        Commands::Plan { module } => cmd_plan(&interruptible(config), &module, &args),
        Commands::Apply { module } => cmd_apply(&interruptible(config), &module, &args),
        Commands::Validate { module } => cmd_validate(&Engine::new(config), &module, &args),
        Commands::Fmt { file, write, check } => cmd_fmt(&file, write, check),
        Commands::Graph { module, format } => {
            cmd_graph(&Engine::new(config), &module, &args, format)
        }
        Commands::Healthcheck { module } => {
            cmd_healthcheck(&interruptible(config), &module, &args)
        }
        Commands::Keystore { action } => {
            cmd_keystore(&Keystore::from_config(&config.keystore), action)
        }
    }
}

/// An engine whose walks are cancelled on Ctrl-C.
fn interruptible(config: EngineConfig) -> Engine {
    let cancel = CancelToken::new();
    spawn_interrupt_listener(cancel.clone());
    Engine::new(config).with_cancel(cancel)
}

/// Listen for Ctrl-C on a helper thread and cancel the token when it arrives.
fn spawn_interrupt_listener(cancel: CancelToken) {
    let spawned = std::thread::Builder::new()
        .name("convergent-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "cannot start signal listener");
                    return;
                }
            };
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling running tasks");
                    cancel.cancel();
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot spawn signal listener");
    }
}

fn cmd_plan(engine: &Engine, module: &str, args: &IndexMap<String, String>) -> Result<i32> {
    let graph = engine.load(module, args)?;
    let planned = engine.plan(&graph)?;
    print!("{}", report::walk_report(Mode::Plan, &planned));
    Ok(plan_exit_code(&Summary::of(&planned)))
}

/// 0 converged, 1 changes pending, 2 when any vertex failed or was skipped.
fn plan_exit_code(summary: &Summary) -> i32 {
    if !summary.is_clean() {
        2
    } else if summary.has_changes() {
        1
    } else {
        0
    }
}

fn cmd_apply(engine: &Engine, module: &str, args: &IndexMap<String, String>) -> Result<i32> {
    let graph = engine.load(module, args)?;
    let applied = engine.apply(&graph)?;
    print!("{}", report::walk_report(Mode::Apply, &applied));
    Ok(apply_exit_code(&Summary::of(&applied)))
}

fn apply_exit_code(summary: &Summary) -> i32 {
    if summary.is_clean() {
        0
    } else {
        1
    }
}

fn cmd_validate(engine: &Engine, module: &str, args: &IndexMap<String, String>) -> Result<i32> {
    let graph = engine.load(module, args)?;
    println!(
        "OK: {} ({} vertices, {} edges)",
        module,
        graph.len(),
        graph.edges().count()
    );
    Ok(0)
}

fn cmd_fmt(file: &Path, write: bool, check: bool) -> Result<i32> {
    let text = std::fs::read_to_string(file).map_err(|e| Error::io(file, e))?;
    let formatted = format_source(&file.display().to_string(), &text)?;
    if check {
        if formatted == text {
            return Ok(0);
        }
        println!("{}", file.display());
        return Ok(1);
    }
    if write {
        if formatted != text {
            std::fs::write(file, &formatted).map_err(|e| Error::io(file, e))?;
            info!(file = %file.display(), "formatted");
        }
        return Ok(0);
    }
    print!("{}", formatted);
    Ok(0)
}

fn format_source(name: &str, text: &str) -> Result<String> {
    let nodes = parser::parse(name, text)?;
    Ok(parser::format_nodes(&nodes))
}

fn cmd_graph(
    engine: &Engine,
    module: &str,
    args: &IndexMap<String, String>,
    format: GraphFormat,
) -> Result<i32> {
    let graph = engine.load(module, args)?;
    match format {
        GraphFormat::Dot => print!("{}", graph.to_dot()),
        GraphFormat::Jsonl => print!("{}", graph.to_jsonl()?),
    }
    Ok(0)
}

fn cmd_healthcheck(engine: &Engine, module: &str, args: &IndexMap<String, String>) -> Result<i32> {
    let graph = engine.load(module, args)?;
    let planned = engine.plan(&graph)?;
    let checked = engine.healthcheck(&planned)?;
    print!("{}", report::health_report(&checked));
    Ok(match health::overall(&checked) {
        HealthLevel::Healthy => 0,
        HealthLevel::Warning | HealthLevel::Error => 1,
    })
}

fn cmd_keystore(keystore: &Keystore, action: KeystoreCommand) -> Result<i32> {
    match action {
        KeystoreCommand::Add { file } => {
            let armored = std::fs::read(&file).map_err(|e| Error::io(&file, e))?;
            let path = keystore.store_trusted_key(&armored)?;
            println!("Added key: {}", path.display());
        }
        KeystoreCommand::Delete { fingerprint } => {
            keystore.delete_trusted_key(&fingerprint)?;
            println!("Deleted key: {}", fingerprint);
        }
        KeystoreCommand::Mask { fingerprint } => {
            let path = keystore.mask_trusted_system_key(&fingerprint)?;
            println!("Masked key: {}", path.display());
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn summary(changed: usize, failed: usize, skipped: usize) -> Summary {
        Summary {
            unchanged: vec!["task.u".into()],
            changed: (0..changed).map(|i| format!("task.c{}", i)).collect(),
            failed: (0..failed).map(|i| (format!("task.f{}", i), "boom".into())).collect(),
            skipped: (0..skipped)
                .map(|i| (format!("task.s{}", i), "task.f0".into()))
                .collect(),
        }
    }

    #[test]
    fn test_cv070_parse_param() {
        assert_eq!(
            parse_param("who=world").unwrap(),
            ("who".to_string(), "world".to_string())
        );
        assert_eq!(
            parse_param("url=http://x/?a=b").unwrap(),
            ("url".to_string(), "http://x/?a=b".to_string())
        );
        assert_eq!(parse_param("empty=").unwrap().1, "");
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("9lives=x").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn test_cv070_flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("convergent.toml");
        fs::write(&path, "workers = 8\n[keystore]\nlocal = \"from-file\"\n").unwrap();
        let global = GlobalArgs {
            config: Some(path),
            workers: Some(2),
            keystore_user: Some(PathBuf::from("/tmp/keys")),
            ..GlobalArgs::default()
        };
        let config = engine_config(&global).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.keystore.local, PathBuf::from("from-file"));
        assert_eq!(config.keystore.user, PathBuf::from("/tmp/keys"));
        assert!(!config.verify_modules);
    }

    #[test]
    fn test_cv070_zero_workers_flag_is_config_error() {
        let global = GlobalArgs {
            workers: Some(0),
            ..GlobalArgs::default()
        };
        assert_eq!(engine_config(&global).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_cv070_exit_codes() {
        assert_eq!(plan_exit_code(&summary(0, 0, 0)), 0);
        assert_eq!(plan_exit_code(&summary(2, 0, 0)), 1);
        assert_eq!(plan_exit_code(&summary(1, 1, 0)), 2);
        assert_eq!(apply_exit_code(&summary(3, 0, 0)), 0);
        assert_eq!(apply_exit_code(&summary(0, 1, 1)), 1);
        assert_eq!(apply_exit_code(&summary(0, 0, 1)), 1);
    }

    #[test]
    fn test_cv070_module_args_keep_order() {
        let global = GlobalArgs {
            params: vec![("b".into(), "1".into()), ("a".into(), "2".into())],
            ..GlobalArgs::default()
        };
        let args = module_args(&global);
        assert_eq!(args.keys().collect::<Vec<_>>(), vec!["b", "a"]);
    }

    #[test]
    fn test_cv070_fmt_check_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("main.cv");
        fs::write(&file, "task \"a\" { check = \"true\" }\n").unwrap();
        let canonical = format_source("main.cv", "task \"a\" { check = \"true\" }\n").unwrap();

        assert_eq!(cmd_fmt(&file, true, false).unwrap(), 0);
        assert_eq!(fs::read_to_string(&file).unwrap(), canonical);
        assert_eq!(cmd_fmt(&file, false, true).unwrap(), 0);

        fs::write(&file, "# comment\n".to_string() + &canonical).unwrap();
        assert_eq!(cmd_fmt(&file, false, true).unwrap(), 1);
    }

    #[test]
    fn test_cv070_fmt_reports_parse_errors() {
        let err = format_source("bad.cv", "task \"a\" {").unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_cv070_keystore_commands() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = Keystore::new(
            dir.path().join("system"),
            dir.path().join("user"),
            dir.path().join("local"),
        );
        let key = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata/keystore/release.asc");
        assert_eq!(cmd_keystore(&keystore, KeystoreCommand::Add { file: key }).unwrap(), 0);
        let fp = "4f87b1510be3f3afcbf579c57e0377e8b9fd746e";
        assert!(dir.path().join("user").join(fp).is_file());

        let masked = cmd_keystore(
            &keystore,
            KeystoreCommand::Mask {
                fingerprint: fp.to_string(),
            },
        );
        assert_eq!(masked.unwrap(), 0);
        assert_eq!(fs::read(dir.path().join("user").join(fp)).unwrap().len(), 0);

        cmd_keystore(
            &keystore,
            KeystoreCommand::Delete {
                fingerprint: fp.to_string(),
            },
        )
        .unwrap();
        assert!(!dir.path().join("user").join(fp).exists());
        assert!(cmd_keystore(
            &keystore,
            KeystoreCommand::Delete {
                fingerprint: fp.to_string()
            }
        )
        .is_err());
    }
}
