use axum::{
    Router,
    extract::Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::core::{
    MonteCarloConfig, MonteCarloSummary, ProjectionRequest, SimulationYear, run_monte_carlo,
    run_projection,
};

/// Upper bound on trials accepted over HTTP.
pub const MAX_API_TRIALS: u32 = 10_000;

#[derive(Parser, Debug)]
#[command(
    name = "nestegg",
    about = "Year-by-year household retirement projections"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Project a household described by a JSON file and print the years.
    Project {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, help = "Override the file's durationYears")]
        years: Option<u32>,
    },
    /// Run seeded market-return trials and print percentile bands.
    MonteCarlo {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 500)]
        trials: u32,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        #[arg(long, default_value_t = 15.0, help = "Annual return volatility in percent, e.g. 15")]
        volatility: f64,
    },
}

pub async fn run_cli(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Serve { port } => run_http_server(port)
            .await
            .map_err(|e| format!("Server error: {e}")),
        Command::Project { input, years } => {
            let mut request = read_request(&input)?;
            if let Some(years) = years {
                request.duration_years = years;
            }
            let years = project(&request)?;
            print_json(&ProjectionResponse { years })
        }
        Command::MonteCarlo {
            input,
            trials,
            seed,
            volatility,
        } => {
            let request = read_request(&input)?;
            let config = MonteCarloConfig {
                trials,
                seed,
                volatility: volatility / 100.0,
            };
            let summary = tokio::task::spawn_blocking(move || {
                let step = (config.trials / 10).max(1);
                let mut report = |done: u32, total: u32| {
                    if done % step == 0 || done == total {
                        info!(done, total, "trials completed");
                    }
                };
                run_monte_carlo(&request, &config, &mut report, &AtomicBool::new(false))
            })
            .await
            .map_err(|e| format!("Monte Carlo worker failed: {e}"))?
            .map_err(|e| e.to_string())?;
            print_json(&summary)
        }
    }
}

fn read_request(path: &Path) -> Result<ProjectionRequest, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    request_from_json(&raw)
}

fn request_from_json(json: &str) -> Result<ProjectionRequest, String> {
    serde_json::from_str::<ProjectionRequest>(json)
        .map_err(|e| format!("Invalid projection JSON payload: {e}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| format!("Failed to serialize output: {e}"))?;
    println!("{text}");
    Ok(())
}

fn project(request: &ProjectionRequest) -> Result<Vec<SimulationYear>, String> {
    run_projection(
        request.duration_years,
        &request.accounts,
        &request.incomes,
        &request.expenses,
        &request.assumptions,
        &request.tax_state,
    )
    .map_err(|e| e.to_string())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MonteCarloPayload {
    #[serde(flatten)]
    household: ProjectionRequest,
    #[serde(default)]
    monte_carlo: MonteCarloConfig,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectionResponse {
    years: Vec<SimulationYear>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Flags a Monte Carlo batch to stop when the request that started it goes
/// away.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub fn router() -> Router {
    Router::new()
        .route("/api/projection", post(projection_handler))
        .route("/api/monte-carlo", post(monte_carlo_handler))
        .fallback(not_found_handler)
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "nestegg HTTP API listening");

    axum::serve(listener, router()).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn projection_handler(Json(request): Json<ProjectionRequest>) -> Response {
    match tokio::task::spawn_blocking(move || project(&request)).await {
        Ok(Ok(years)) => json_response(StatusCode::OK, ProjectionResponse { years }),
        Ok(Err(msg)) => error_response(StatusCode::BAD_REQUEST, &msg),
        Err(err) => {
            warn!(error = %err, "projection worker failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Projection worker failed")
        }
    }
}

async fn monte_carlo_handler(Json(payload): Json<MonteCarloPayload>) -> Response {
    let MonteCarloPayload {
        household,
        monte_carlo,
    } = payload;
    if monte_carlo.trials > MAX_API_TRIALS {
        return error_response(
            StatusCode::BAD_REQUEST,
            &format!("trials must be at most {MAX_API_TRIALS}"),
        );
    }

    let cancel = Arc::new(AtomicBool::new(false));
    let _guard = CancelOnDrop(Arc::clone(&cancel));
    let worker = tokio::task::spawn_blocking(move || {
        run_monte_carlo(&household, &monte_carlo, &mut |_, _| {}, &cancel)
    });
    let summary: MonteCarloSummary = match worker.await {
        Ok(Ok(summary)) => summary,
        Ok(Err(err)) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(err) => {
            warn!(error = %err, "monte carlo worker failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Monte Carlo worker failed");
        }
    };
    json_response(StatusCode::OK, summary)
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Account, Income};

    const HOUSEHOLD: &str = r#"{
      "durationYears": 3,
      "accounts": [
        {"className": "SavedAccount", "id": "cash", "name": "Cash", "amount": 25000, "apr": 0.04},
        {"className": "InvestedAccount", "id": "401k", "name": "401k", "amount": 150000,
         "taxType": "traditional401k"}
      ],
      "incomes": [
        {"className": "WorkIncome", "id": "job", "name": "Job", "amount": 95000,
         "earnedIncome": true, "preTaxContribution": 10000}
      ],
      "expenses": [
        {"className": "Expense", "id": "living", "name": "Living", "amount": 4000,
         "frequency": "monthly"}
      ],
      "assumptions": {
        "macro": {"inflationRate": 0.025},
        "demographics": {"birthYear": 1985, "startYear": 2024, "retirementAge": 60}
      },
      "taxState": {"filingStatus": "married-joint", "stateCode": "CA"}
    }"#;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[test]
    fn request_from_json_fills_defaults_for_partial_payloads() {
        let request = request_from_json(r#"{"assumptions": {"macro": {"inflationRate": 0.02}}}"#)
            .expect("json should parse");
        assert_eq!(request.duration_years, 30);
        assert!(request.accounts.is_empty());
        assert_eq!(request.assumptions.economy.inflation_rate, 0.02);
        assert_eq!(request.assumptions.demographics.retirement_age, 65);
    }

    #[test]
    fn request_from_json_rejects_unknown_account_classes() {
        let json = r#"{"accounts": [{"className": "CryptoWallet", "id": "coins", "name": "Coins", "amount": 1}]}"#;
        let err = request_from_json(json).expect_err("unknown className must be rejected");
        assert!(err.contains("Invalid projection JSON payload"));
    }

    #[test]
    fn request_from_json_parses_tagged_entities() {
        let request = request_from_json(HOUSEHOLD).expect("json should parse");
        assert_eq!(request.accounts.len(), 2);
        assert!(matches!(request.accounts[1], Account::Invested(_)));
        let Income::Work(work) = &request.incomes[0] else {
            panic!("expected work income");
        };
        assert_eq!(work.pre_tax_contribution, 10_000.0);
        assert_eq!(request.tax_state.state_code, "CA");
    }

    #[test]
    fn cli_parses_monte_carlo_subcommand() {
        let cli = Cli::try_parse_from([
            "nestegg",
            "monte-carlo",
            "--input",
            "household.json",
            "--trials",
            "250",
            "--volatility",
            "12",
        ])
        .expect("valid args");
        assert_eq!(
            cli.command,
            Command::MonteCarlo {
                input: PathBuf::from("household.json"),
                trials: 250,
                seed: 42,
                volatility: 12.0,
            }
        );
    }

    #[test]
    fn cli_defaults_serve_port() {
        let cli = Cli::try_parse_from(["nestegg", "serve"]).expect("valid args");
        assert_eq!(cli.command, Command::Serve { port: 8080 });
    }

    #[tokio::test]
    async fn projection_handler_returns_one_record_per_year() {
        let request = request_from_json(HOUSEHOLD).expect("json should parse");
        let response = projection_handler(Json(request)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL),
            Some(&HeaderValue::from_static("no-store"))
        );
        let body = body_json(response).await;
        let years = body["years"].as_array().expect("years");
        assert_eq!(years.len(), 3);
        assert_eq!(years[0]["year"], 2024);
        assert!(years[0]["taxes"]["state"].as_f64().expect("state tax") > 0.0);
    }

    #[tokio::test]
    async fn projection_handler_maps_engine_errors_to_bad_request() {
        let mut request = ProjectionRequest::default();
        request.assumptions.demographics.birth_year = 2030;
        let response = projection_handler(Json(request)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().expect("error").contains("birth year"));
    }

    #[tokio::test]
    async fn monte_carlo_handler_rejects_oversized_batches() {
        let payload: MonteCarloPayload =
            serde_json::from_str(r#"{"monteCarlo": {"trials": 1000000}}"#).expect("payload");
        let response = monte_carlo_handler(Json(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn monte_carlo_handler_returns_percentile_bands() {
        let payload: MonteCarloPayload = serde_json::from_str(
            r#"{
              "durationYears": 4,
              "accounts": [{"className": "SavedAccount", "id": "cash", "name": "Cash", "amount": 50000}],
              "monteCarlo": {"trials": 5, "seed": 9, "volatility": 0.1}
            }"#,
        )
        .expect("payload");
        let response = monte_carlo_handler(Json(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["trialsCompleted"], 5);
        assert_eq!(body["years"].as_array().expect("years").len(), 4);
    }
}
