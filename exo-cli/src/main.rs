//! exo-cli: command-line client for the exoplanet detection API
//!
//! # Subcommands
//! - `status`                      server health and loaded model
//! - `features`                    feature names the model expects
//! - `example`                     random example row from the server
//! - `predict --file <json>`       classify one feature vector
//! - `habitability --file <json>`  habitability narrative only
//! - `upload <csv>`                import a CSV into the dataset table
//! - `export`                      export the dataset table on the server
//! - `db-status`                   database connectivity and row count
//! - `retrain`                     retrain the served model from the dataset table
//! - `train --data <csv>`          train locally, without a server

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use exo_core::config::ModelConfig;
use exo_core::{train_model, Dataset, TrainingParams};
use reqwest::blocking::{multipart, Client, RequestBuilder};
use serde_json::Value;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "exo-cli", version, about = "Exoplanet detection API client")]
struct Cli {
    /// API server URL (overrides EXO_HTTP_URL env var)
    #[arg(long, env = "EXO_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show server status
    Status,

    /// List the features the model expects
    Features,

    /// Fetch a random example row
    Example,

    /// Classify the feature vector in a JSON file
    Predict {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Run habitability analysis on the values in a JSON file
    Habitability {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Upload a CSV into the dataset table
    Upload { csv: PathBuf },

    /// Export the dataset table to CSV on the server
    Export,

    /// Show database connectivity and row count
    DbStatus,

    /// Retrain the served model
    Retrain {
        /// Train from the last export instead of exporting first
        #[arg(long)]
        use_existing_export: bool,
    },

    /// Train a model locally from a CSV and write the artifacts
    Train {
        #[arg(long)]
        data: PathBuf,

        #[arg(long, default_value = "models")]
        out: PathBuf,

        #[arg(long, default_value = "tfopwg_disp")]
        target: String,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: u64) -> anyhow::Result<Client> {
    Ok(Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Send a request and decode the JSON body. Non-2xx responses become errors
/// carrying the server's `error` message.
fn send(request: RequestBuilder) -> anyhow::Result<Value> {
    let resp = request.send().context("connection failed")?;
    let status = resp.status();
    let body: Value = resp.json().unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body["error"].as_str().unwrap_or("no error message");
        bail!("server returned {}: {}", status, message);
    }
    Ok(body)
}

fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}

pub fn format_prediction(body: &Value) -> String {
    let mut out = format!(
        "{}\nConfidence: {:.1}%",
        body["label"].as_str().unwrap_or("?"),
        body["confidence"].as_f64().unwrap_or(0.0) * 100.0
    );
    if let Some(hab) = body.get("habitability").filter(|h| !h.is_null()) {
        match hab["habitability_score"].as_f64() {
            Some(score) => out.push_str(&format!("\nHabitability: {:.0}%", score)),
            None => out.push_str("\nHabitability: unknown"),
        }
        if let Some(explanation) = hab["explanation"].as_str() {
            out.push_str(&format!("\n{}", explanation));
        }
    }
    if let Some(path) = body["visualization"]["image_path"].as_str() {
        out.push_str(&format!("\nImage: {}", path));
    }
    out
}

pub fn format_status(body: &Value) -> String {
    let flag = |key: &str| if body[key].as_bool().unwrap_or(false) { "yes" } else { "no" };
    format!(
        "Server:       {}\nVersion:      {}\nModel:        {} ({} features)\nLLM:          {}\nImages:       {}",
        body["status"].as_str().unwrap_or("unknown"),
        body["version"].as_str().unwrap_or("?"),
        flag("model_loaded"),
        body["num_features"].as_u64().unwrap_or(0),
        flag("llm_enabled"),
        flag("image_enabled"),
    )
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let server = cli.server.trim_end_matches('/');
    let url = |route: &str| format!("{}/api/{}", server, route);

    let (body, human) = match cli.command {
        Commands::Status => {
            let body = send(client(10)?.get(url("health")))?;
            let text = format_status(&body);
            (body, text)
        }
        Commands::Features => {
            let body = send(client(10)?.get(url("features")))?;
            let text = body["features"]
                .as_array()
                .map(|fs| {
                    fs.iter()
                        .map(|f| {
                            format!(
                                "{:<16} {:<20} {}",
                                f["name"].as_str().unwrap_or(""),
                                f["group"].as_str().unwrap_or(""),
                                f["label"].as_str().unwrap_or("")
                            )
                        })
                        .collect::<Vec<_>>()
                        .join("\n")
                })
                .unwrap_or_default();
            (body, text)
        }
        Commands::Example => {
            let body = send(client(10)?.get(url("example")))?;
            let text = serde_json::to_string_pretty(&body)?;
            (body, text)
        }
        Commands::Predict { file } => {
            let payload = read_json_file(&file)?;
            let body = send(client(180)?.post(url("predict")).json(&payload))?;
            let text = format_prediction(&body);
            (body, text)
        }
        Commands::Habitability { file } => {
            let payload = read_json_file(&file)?;
            let body = send(client(120)?.post(url("habitability")).json(&payload))?;
            let text = format!(
                "Habitability: {}\n{}",
                body["habitability_score"]
                    .as_f64()
                    .map(|s| format!("{:.0}%", s))
                    .unwrap_or_else(|| "unknown".to_string()),
                body["explanation"].as_str().unwrap_or("")
            );
            (body, text)
        }
        Commands::Upload { csv } => {
            let form = multipart::Form::new()
                .file("file", &csv)
                .with_context(|| format!("cannot read {}", csv.display()))?;
            let body = send(client(300)?.post(url("upload-csv")).multipart(form))?;
            let text = format!(
                "Inserted {} rows ({} total)",
                body["rows_inserted"], body["total_rows"]
            );
            (body, text)
        }
        Commands::Export => {
            let body = send(client(300)?.post(url("export-dataset")))?;
            let text = format!(
                "Exported {} rows to {}",
                body["rows_exported"],
                body["output_path"].as_str().unwrap_or("?")
            );
            (body, text)
        }
        Commands::DbStatus => {
            let body = send(client(10)?.get(url("database-status")))?;
            let text = format!("Connected, {} rows", body["row_count"]);
            (body, text)
        }
        Commands::Retrain { use_existing_export } => {
            let payload = serde_json::json!({ "use_existing_export": use_existing_export });
            let body = send(client(3600)?.post(url("retrain")).json(&payload))?;
            let text = format!(
                "Retrained: AUC {:.4} on {} rows",
                body["results"]["auc_score"].as_f64().unwrap_or(f64::NAN),
                body["results"]["dataset_size"]
            );
            (body, text)
        }
        Commands::Train {
            data,
            out,
            target,
            seed,
        } => {
            let dataset = Dataset::from_path(&data, &target)?;
            let params = TrainingParams {
                seed,
                ..Default::default()
            };
            let (bundle, report) = train_model(&dataset, &params)?;
            let model_config = ModelConfig {
                dir: out,
                ..Default::default()
            };
            bundle.save(&model_config)?;
            let body = serde_json::to_value(&report)?;
            let text = format!(
                "AUC {:.4} ({} trees), artifacts written to {}",
                report.auc_score,
                report.n_trees,
                model_config.dir.display()
            );
            (body, text)
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&body)?);
    } else {
        println!("{}", human);
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("exo-cli: {:#}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========================================================================
    // TEST 1: positive prediction shows score, explanation and image
    // ========================================================================
    #[test]
    fn test_format_positive_prediction() {
        let body = json!({
            "label": "Exoplanet Detected! 🌟",
            "confidence": 0.9731,
            "habitability": {"habitability_score": 42.0, "explanation": "Warm.", "success": true},
            "visualization": {"success": true, "image_path": "static/generated/exoplanet_ab.jpg"}
        });
        let text = format_prediction(&body);
        assert!(text.starts_with("Exoplanet Detected!"));
        assert!(text.contains("Confidence: 97.3%"));
        assert!(text.contains("Habitability: 42%\nWarm."));
        assert!(text.ends_with("Image: static/generated/exoplanet_ab.jpg"));
    }

    // ========================================================================
    // TEST 2: negative prediction has no habitability section
    // ========================================================================
    #[test]
    fn test_format_negative_prediction() {
        let body = json!({
            "label": "Not an Exoplanet ❌",
            "confidence": 0.12,
            "habitability": null,
            "visualization": null
        });
        assert_eq!(format_prediction(&body), "Not an Exoplanet ❌\nConfidence: 12.0%");
    }

    // ========================================================================
    // TEST 3: status formatting
    // ========================================================================
    #[test]
    fn test_format_status() {
        let body = json!({
            "status": "healthy",
            "version": "0.1.0",
            "model_loaded": true,
            "num_features": 40,
            "llm_enabled": false,
            "image_enabled": true
        });
        let text = format_status(&body);
        assert!(text.contains("Model:        yes (40 features)"));
        assert!(text.contains("LLM:          no"));
    }

    // ========================================================================
    // TEST 4: CLI parses server override and subcommand flags
    // ========================================================================
    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "exo-cli",
            "--server",
            "http://example.org:5000/",
            "retrain",
            "--use-existing-export",
        ])
        .unwrap();
        assert_eq!(cli.server, "http://example.org:5000/");
        assert!(matches!(cli.command, Commands::Retrain { use_existing_export: true }));

        let cli = Cli::try_parse_from(["exo-cli", "train", "--data", "tess.csv"]).unwrap();
        match cli.command {
            Commands::Train { out, target, seed, .. } => {
                assert_eq!(out, PathBuf::from("models"));
                assert_eq!(target, "tfopwg_disp");
                assert_eq!(seed, 42);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
