//! Printer operations exposed to the dashboard
//!
//! Each operation is a single dispatcher call with a fixed command name.
//! Motion and temperature control go through the `send` command as G-code.

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use crate::broadcast::StateSource;
use crate::config::UpstreamConfig;
use crate::dispatcher::{Dispatcher, Params};
use crate::error::GatewayError;

/// Emergency stop
const GCODE_STOP: &str = "M112";
/// Pause SD print
const GCODE_PAUSE: &str = "M25";
/// Resume SD print
const GCODE_RESUME: &str = "M24";
/// Home all axes
const GCODE_HOME: &str = "G28";

/// Repetier Server client for one printer
#[derive(Debug, Clone)]
pub struct PrinterClient {
    dispatcher: Dispatcher,
    printer: u32,
}

impl PrinterClient {
    pub fn new(dispatcher: Dispatcher, printer: u32) -> Self {
        Self {
            dispatcher,
            printer,
        }
    }

    pub fn from_config(config: &UpstreamConfig) -> Result<Self, GatewayError> {
        Ok(Self::new(Dispatcher::from_config(config)?, config.printer))
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn authenticate(&self) -> bool {
        self.dispatcher.authenticate().await
    }

    pub async fn get_state(&self) -> Result<Value, GatewayError> {
        self.dispatcher.dispatch("stateList", Params::new()).await
    }

    pub async fn list_printers(&self) -> Result<Value, GatewayError> {
        self.dispatcher.dispatch("listPrinter", Params::new()).await
    }

    pub async fn list_jobs(&self) -> Result<Value, GatewayError> {
        self.dispatcher.dispatch("listJobs", Params::new()).await
    }

    /// Stored G-code models available for printing
    pub async fn list_models(&self) -> Result<Value, GatewayError> {
        self.dispatcher.dispatch("listModels", Params::new()).await
    }

    pub async fn get_model_info(&self, id: u64) -> Result<Value, GatewayError> {
        self.dispatcher
            .dispatch("getModelInfo", params(json!({ "id": id })))
            .await
    }

    /// Copy a stored model into the job queue and start it
    pub async fn start_print(&self, id: u64) -> Result<Value, GatewayError> {
        self.dispatcher
            .dispatch("copyModel", params(json!({ "id": id, "autostart": 1 })))
            .await
    }

    pub async fn stop_print(&self) -> Result<Value, GatewayError> {
        self.send_gcode(GCODE_STOP).await
    }

    pub async fn pause_print(&self) -> Result<Value, GatewayError> {
        self.send_gcode(GCODE_PAUSE).await
    }

    pub async fn resume_print(&self) -> Result<Value, GatewayError> {
        self.send_gcode(GCODE_RESUME).await
    }

    pub async fn set_extruder_temperature(&self, celsius: f64) -> Result<Value, GatewayError> {
        validate_temperature(celsius)?;
        self.send_gcode(&format!("M104 S{}", celsius)).await
    }

    pub async fn set_bed_temperature(&self, celsius: f64) -> Result<Value, GatewayError> {
        validate_temperature(celsius)?;
        self.send_gcode(&format!("M140 S{}", celsius)).await
    }

    /// Forward a raw G-code line to the printer
    pub async fn send_raw_command(&self, command: &str) -> Result<Value, GatewayError> {
        let command = command.trim();
        if command.is_empty() {
            return Err(GatewayError::InvalidInput("empty G-code command".to_string()));
        }
        self.send_gcode(command).await
    }

    pub async fn get_logs(&self) -> Result<Value, GatewayError> {
        self.dispatcher
            .dispatch("messages", params(json!({ "id": self.printer })))
            .await
    }

    pub async fn home_all_axes(&self) -> Result<Value, GatewayError> {
        self.send_gcode(GCODE_HOME).await
    }

    /// Upload a G-code file, base64-encoded inside the envelope
    pub async fn upload_file(&self, filename: &str, content: &[u8]) -> Result<Value, GatewayError> {
        let filename = filename.trim();
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(GatewayError::InvalidInput(format!(
                "invalid file name: {:?}",
                filename
            )));
        }

        let data = base64::engine::general_purpose::STANDARD.encode(content);
        tracing::info!(filename, bytes = content.len(), "Uploading file to upstream");

        self.dispatcher
            .dispatch(
                "upload",
                params(json!({
                    "printer": self.printer,
                    "filename": filename,
                    "data": data,
                })),
            )
            .await
    }

    async fn send_gcode(&self, gcode: &str) -> Result<Value, GatewayError> {
        self.dispatcher
            .dispatch("send", params(json!({ "printer": self.printer, "cmd": gcode })))
            .await
    }
}

#[async_trait]
impl StateSource for PrinterClient {
    async fn fetch_state(&self) -> Result<Value, GatewayError> {
        self.get_state().await
    }
}

fn params(value: Value) -> Params {
    match value {
        Value::Object(map) => map,
        _ => Params::new(),
    }
}

fn validate_temperature(celsius: f64) -> Result<(), GatewayError> {
    if !celsius.is_finite() || celsius < 0.0 {
        return Err(GatewayError::InvalidInput(format!(
            "invalid temperature: {}",
            celsius
        )));
    }
    Ok(())
}
