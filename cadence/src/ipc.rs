//! IPC interface for Cadence

use crate::engine::{EngineStatus, SetRateReason, VoltageEntry};
use crate::error::Result as ScalingResult;
use crate::hotplug::{CoreLifecycle, HotplugCoordinator, HotplugEvent};
use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

/// IPC request types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IpcRequest {
    /// Current frequency of a core
    GetRate { cpu: usize },

    /// Move a core to an exact table frequency. Only normal requests are
    /// served; idle and hot-plug transitions never come over the socket.
    SetRate {
        cpu: usize,
        khz: u32,
        #[serde(default)]
        reason: SetRateReason,
    },

    /// Frequencies available to the policy layer (or every row)
    ListFrequencies {
        #[serde(default)]
        all: bool,
    },

    /// Deliver a lifecycle event for a core
    Hotplug { cpu: usize, event: HotplugEvent },

    /// Core voltage per frequency
    GetVoltageTable,

    /// Override one row's core voltage
    SetCoreVoltage { khz: u32, uv: u32 },

    /// Shift every row's core voltage
    AdjustVoltages { delta_uv: i32 },

    /// Set the core-rail floor
    SetVoltageFloor { uv: u32 },

    /// Enable rows above the boot maximum up to a frequency
    SetScalingLimit { khz: u32 },

    /// Get full daemon status
    GetStatus,
}

/// IPC response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Success { data: serde_json::Value },
    Error { message: String },
}

/// Full daemon status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub version: String,
    pub engine: EngineStatus,
    pub lifecycle: Vec<CoreLifecycle>,
}

/// IPC handler trait
pub trait IpcHandler: Send + Sync {
    fn get_rate(&self, cpu: usize) -> ScalingResult<u32>;
    fn set_rate(&self, cpu: usize, khz: u32) -> ScalingResult<()>;
    fn list_frequencies(&self, all: bool) -> Vec<u32>;
    fn hotplug(&self, cpu: usize, event: HotplugEvent) -> ScalingResult<CoreLifecycle>;
    fn voltage_table(&self) -> Vec<VoltageEntry>;
    fn set_core_voltage(&self, khz: u32, uv: u32) -> ScalingResult<()>;
    fn adjust_voltages(&self, delta_uv: i32) -> ScalingResult<()>;
    fn set_voltage_floor(&self, uv: u32) -> ScalingResult<()>;
    fn set_scaling_limit(&self, khz: u32) -> Vec<u32>;
    fn get_daemon_status(&self) -> DaemonStatus;
}

impl IpcHandler for HotplugCoordinator {
    fn get_rate(&self, cpu: usize) -> ScalingResult<u32> {
        self.engine().get_rate(cpu)
    }

    fn set_rate(&self, cpu: usize, khz: u32) -> ScalingResult<()> {
        self.request_rate(cpu, khz)
    }

    fn list_frequencies(&self, all: bool) -> Vec<u32> {
        if all {
            self.engine().all_frequencies()
        } else {
            self.engine().scaling_frequencies()
        }
    }

    fn hotplug(&self, cpu: usize, event: HotplugEvent) -> ScalingResult<CoreLifecycle> {
        self.handle(cpu, event)
    }

    fn voltage_table(&self) -> Vec<VoltageEntry> {
        self.engine().voltage_table()
    }

    fn set_core_voltage(&self, khz: u32, uv: u32) -> ScalingResult<()> {
        self.engine().set_core_voltage(khz, uv)
    }

    fn adjust_voltages(&self, delta_uv: i32) -> ScalingResult<()> {
        self.engine().adjust_core_voltages(delta_uv)
    }

    fn set_voltage_floor(&self, uv: u32) -> ScalingResult<()> {
        self.engine().set_voltage_floor(uv)
    }

    fn set_scaling_limit(&self, khz: u32) -> Vec<u32> {
        self.engine().set_scaling_limit(khz)
    }

    fn get_daemon_status(&self) -> DaemonStatus {
        DaemonStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            engine: self.engine().status(),
            lifecycle: self.states(),
        }
    }
}

/// IPC server
pub struct IpcServer<H: IpcHandler> {
    socket_path: String,
    handler: Arc<H>,
}

impl<H: IpcHandler + 'static> IpcServer<H> {
    pub fn new(socket_path: impl Into<String>, handler: Arc<H>) -> Self {
        Self {
            socket_path: socket_path.into(),
            handler,
        }
    }

    /// Replace any stale socket and bind
    pub fn bind(&self) -> Result<UnixListener> {
        let _ = std::fs::remove_file(&self.socket_path);

        if let Some(parent) = std::path::Path::new(&self.socket_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Cadence IPC listening on {}", self.socket_path);
        Ok(listener)
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    pub async fn serve(&self, listener: UnixListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&self.handler);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, handler).await {
                            tracing::error!("Client error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                }
            }
        }
    }
}

async fn handle_client<H: IpcHandler>(stream: UnixStream, handler: Arc<H>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => process_request(request, handler.as_ref()),
            Err(e) => IpcResponse::Error {
                message: format!("Invalid request: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

fn success<T: Serialize>(value: T) -> IpcResponse {
    match serde_json::to_value(value) {
        Ok(data) => IpcResponse::Success { data },
        Err(e) => IpcResponse::Error {
            message: format!("Encoding response: {}", e),
        },
    }
}

fn reply<T: Serialize>(result: ScalingResult<T>) -> IpcResponse {
    match result {
        Ok(value) => success(value),
        Err(e) => {
            if e.is_rejected_request() {
                debug!("Rejected request: {}", e);
            } else {
                warn!("Request failed: {}", e);
            }
            IpcResponse::Error {
                message: e.to_string(),
            }
        }
    }
}

pub fn process_request<H: IpcHandler>(request: IpcRequest, handler: &H) -> IpcResponse {
    match request {
        IpcRequest::GetRate { cpu } => reply(handler.get_rate(cpu).map(|khz| serde_json::json!({"cpu": cpu, "khz": khz}))),

        // Idle callers skip the raise phase and hot-plug callers skip the
        // target's mux; neither can be vouched for from outside.
        IpcRequest::SetRate {
            reason: SetRateReason::Hotplug,
            ..
        } => IpcResponse::Error {
            message: "Hot-plug transitions must use the Hotplug request".to_string(),
        },

        IpcRequest::SetRate { reason, .. } if reason.is_idle() => IpcResponse::Error {
            message: format!("{:?} transitions are not accepted over IPC", reason),
        },

        IpcRequest::SetRate { cpu, khz, .. } => reply(
            handler
                .set_rate(cpu, khz)
                .map(|()| serde_json::json!({"cpu": cpu, "khz": khz})),
        ),

        IpcRequest::ListFrequencies { all } => success(serde_json::json!({"frequencies": handler.list_frequencies(all)})),

        IpcRequest::Hotplug { cpu, event } => reply(
            handler
                .hotplug(cpu, event)
                .map(|state| serde_json::json!({"cpu": cpu, "state": state})),
        ),

        IpcRequest::GetVoltageTable => success(handler.voltage_table()),

        IpcRequest::SetCoreVoltage { khz, uv } => reply(
            handler
                .set_core_voltage(khz, uv)
                .map(|()| serde_json::json!({"khz": khz, "uv": uv})),
        ),

        IpcRequest::AdjustVoltages { delta_uv } => reply(handler.adjust_voltages(delta_uv).map(|()| handler.voltage_table())),

        IpcRequest::SetVoltageFloor { uv } => reply(
            handler
                .set_voltage_floor(uv)
                .map(|()| serde_json::json!({"floor_uv": uv})),
        ),

        IpcRequest::SetScalingLimit { khz } => success(serde_json::json!({"frequencies": handler.set_scaling_limit(khz)})),

        IpcRequest::GetStatus => success(handler.get_daemon_status()),
    }
}

/// IPC client
pub struct IpcClient {
    socket_path: String,
}

#[derive(Deserialize)]
struct Frequencies {
    frequencies: Vec<u32>,
}

#[derive(Deserialize)]
struct Rate {
    khz: u32,
}

#[derive(Deserialize)]
struct Lifecycle {
    state: CoreLifecycle,
}

impl IpcClient {
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub async fn send(&self, request: IpcRequest) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        let request_json = serde_json::to_string(&request)?;
        stream.write_all(request_json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;

        Ok(serde_json::from_str(&line)?)
    }

    async fn request<T: DeserializeOwned>(&self, request: IpcRequest) -> Result<T> {
        match self.send(request).await? {
            IpcResponse::Success { data } => Ok(serde_json::from_value(data)?),
            IpcResponse::Error { message } => Err(anyhow::anyhow!(message)),
        }
    }

    pub async fn get_rate(&self, cpu: usize) -> Result<u32> {
        let rate: Rate = self.request(IpcRequest::GetRate { cpu }).await?;
        Ok(rate.khz)
    }

    pub async fn set_rate(&self, cpu: usize, khz: u32) -> Result<()> {
        let request = IpcRequest::SetRate {
            cpu,
            khz,
            reason: SetRateReason::Normal,
        };
        let _: serde_json::Value = self.request(request).await?;
        Ok(())
    }

    pub async fn list_frequencies(&self, all: bool) -> Result<Vec<u32>> {
        let list: Frequencies = self.request(IpcRequest::ListFrequencies { all }).await?;
        Ok(list.frequencies)
    }

    pub async fn hotplug(&self, cpu: usize, event: HotplugEvent) -> Result<CoreLifecycle> {
        let lifecycle: Lifecycle = self.request(IpcRequest::Hotplug { cpu, event }).await?;
        Ok(lifecycle.state)
    }

    pub async fn voltage_table(&self) -> Result<Vec<VoltageEntry>> {
        self.request(IpcRequest::GetVoltageTable).await
    }

    pub async fn set_core_voltage(&self, khz: u32, uv: u32) -> Result<()> {
        let _: serde_json::Value = self.request(IpcRequest::SetCoreVoltage { khz, uv }).await?;
        Ok(())
    }

    pub async fn adjust_voltages(&self, delta_uv: i32) -> Result<Vec<VoltageEntry>> {
        self.request(IpcRequest::AdjustVoltages { delta_uv }).await
    }

    pub async fn set_voltage_floor(&self, uv: u32) -> Result<()> {
        let _: serde_json::Value = self.request(IpcRequest::SetVoltageFloor { uv }).await?;
        Ok(())
    }

    pub async fn set_scaling_limit(&self, khz: u32) -> Result<Vec<u32>> {
        let list: Frequencies = self.request(IpcRequest::SetScalingLimit { khz }).await?;
        Ok(list.frequencies)
    }

    pub async fn get_status(&self) -> Result<DaemonStatus> {
        self.request(IpcRequest::GetStatus).await
    }
}
