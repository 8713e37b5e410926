use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use nest_codec::{decode, normalize, Blob, Object, ObjectKind};
use nest_engine::ForestConfig;
use nest_modules::{apply_edits, Gitmodules, ModuleEdit, Submodule};
use nest_resolve::{parse_rule, GenerateContext, GeneratorRegistry, VirtualNode, RULE_SUFFIX};
use serde_json::{json, Value};
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<String> {
    let format = cli.format;
    match cli.command {
        Command::HashObject(args) => cmd_hash_object(args, format),
        Command::CheckRule(args) => cmd_check_rule(args, format),
        Command::Modules(args) => cmd_modules(args, format),
        Command::Config(args) => cmd_config(args, format),
    }
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn read_text(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn cmd_hash_object(args: HashObjectArgs, format: OutputFormat) -> anyhow::Result<String> {
    let bytes = read(&args.path)?;
    let kind = ObjectKind::from(args.kind);
    let object = if args.json {
        let value: Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {} as JSON", args.path.display()))?;
        normalize(kind, &value)?
    } else if kind == ObjectKind::Blob {
        Object::Blob(Blob::new(bytes))
    } else {
        decode(kind, &bytes)?
    };
    let id = object.id();
    debug!(%id, %kind, "hashed object");

    Ok(match format {
        OutputFormat::Text => format!("{id}\n"),
        OutputFormat::Json => format!(
            "{}\n",
            json!({ "id": id.to_hex(), "kind": kind.as_str(), "size": object.encode().len() })
        ),
    })
}

fn cmd_check_rule(args: CheckRuleArgs, format: OutputFormat) -> anyhow::Result<String> {
    let text = read_text(&args.path)?;
    let rule = parse_rule(&text).map_err(|reason| anyhow!("{}: {reason}", args.path.display()))?;
    let registry = GeneratorRegistry::with_builtins();
    let builtin = registry.get(&rule.generator);
    let is_builtin = builtin.is_some();

    let node = if args.eval {
        let Some(generator) = builtin else {
            bail!(
                "unknown generator {:?} (built-in: {})",
                rule.generator,
                registry.names().join(", ")
            );
        };
        let name = args
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let ctx = GenerateContext {
            target: name.strip_suffix(RULE_SUFFIX).unwrap_or(&name).to_string(),
            rule_path: name,
            root: String::new(),
        };
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        runtime.block_on(generator.generate(&ctx, &rule.args))?
    } else {
        None
    };

    if format == OutputFormat::Json {
        return Ok(format!(
            "{}\n",
            json!({
                "generator": rule.generator,
                "args": rule.args,
                "builtin": is_builtin,
                "output": node.as_ref().map(|n| describe(n, "")),
            })
        ));
    }

    let mut out = format!(
        "{} {} ({} args)\n",
        "✓".green().bold(),
        rule.generator.bold(),
        rule.args.len()
    );
    if !is_builtin {
        out.push_str(&format!(
            "  {} not a built-in generator; it must be registered before use\n",
            "warning:".yellow()
        ));
    }
    match (&node, args.eval) {
        (Some(node), _) => {
            for line in describe(node, "") {
                out.push_str(&format!("  {line}\n"));
            }
        }
        (None, true) => out.push_str("  generator defines nothing for this target\n"),
        (None, false) => {}
    }
    Ok(out)
}

/// One line per node, paths relative to the rule target.
fn describe(node: &VirtualNode, path: &str) -> Vec<String> {
    let at = if path.is_empty() { "." } else { path };
    match node {
        VirtualNode::File { data, executable } => {
            let kind = if *executable { "exec" } else { "file" };
            vec![format!("{kind} {at} ({} bytes)", data.len())]
        }
        VirtualNode::Link(target) => vec![format!("link {at} -> {target}")],
        VirtualNode::Tree(children) => {
            let mut lines = vec![format!("tree {at}/")];
            for (name, child) in children {
                let child_path = if path.is_empty() {
                    name.clone()
                } else {
                    format!("{path}/{name}")
                };
                lines.extend(describe(child, &child_path));
            }
            lines
        }
    }
}

fn cmd_modules(args: ModulesArgs, format: OutputFormat) -> anyhow::Result<String> {
    let text = read_text(&args.path)?;
    let mut edits = Vec::with_capacity(args.add.len() + args.remove.len());
    for pair in &args.add {
        let (path, url) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("--add expects PATH=URL, got {pair:?}"))?;
        edits.push(ModuleEdit::Add(Submodule::new(path, path, url)));
    }
    for path in args.remove {
        edits.push(ModuleEdit::Remove { path });
    }

    let updated = apply_edits(Some(text.as_str()), &edits)?.unwrap_or_default();
    match format {
        OutputFormat::Text => Ok(updated),
        OutputFormat::Json => {
            let modules = Gitmodules::parse(&updated)?;
            let listing: Vec<Value> = modules
                .iter()
                .map(|m| json!({ "name": m.name, "path": m.path, "url": m.url }))
                .collect();
            Ok(format!("{}\n", Value::Array(listing)))
        }
    }
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<String> {
    let config = match &args.path {
        Some(path) => ForestConfig::load(path)?,
        None => ForestConfig::default(),
    };
    Ok(match format {
        OutputFormat::Text => config.to_toml_string()?,
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&config)?),
    })
}
