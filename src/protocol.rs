use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::EngineError;
use crate::hub::HubMessage;
use crate::sla::SlaWindow;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u32,
    pub timestamp: u64,
    pub command_type: CommandType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Ping,
    Status,
    Deploy {
        manifest: String,
    },
    ListResources {
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    },
    GetResource {
        name: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    },
    DeleteResource {
        name: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        kind: Option<String>,
    },
    GetSnapshot,
    GetHistory {
        window_minutes: u64,
    },
    GetSla {
        #[serde(default)]
        window: SlaWindow,
    },
    Subscribe,
    Unsubscribe,
    InjectIncident {
        service: String,
        scenario: String,
    },
    ClearIncidents {
        #[serde(default)]
        service: Option<String>,
    },
    SetIncidentInjection {
        enabled: bool,
    },
    GetIncidents,
}

impl CommandType {
    pub fn name(&self) -> &'static str {
        match self {
            CommandType::Ping => "ping",
            CommandType::Status => "status",
            CommandType::Deploy { .. } => "deploy",
            CommandType::ListResources { .. } => "list_resources",
            CommandType::GetResource { .. } => "get_resource",
            CommandType::DeleteResource { .. } => "delete_resource",
            CommandType::GetSnapshot => "get_snapshot",
            CommandType::GetHistory { .. } => "get_history",
            CommandType::GetSla { .. } => "get_sla",
            CommandType::Subscribe => "subscribe",
            CommandType::Unsubscribe => "unsubscribe",
            CommandType::InjectIncident { .. } => "inject_incident",
            CommandType::ClearIncidents { .. } => "clear_incidents",
            CommandType::SetIncidentInjection { .. } => "set_incident_injection",
            CommandType::GetIncidents => "get_incidents",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub timestamp: u64,
    pub status: ResponseStatus,
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl CommandResponse {
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    InvalidCommand,
    NotFound,
    ParseError,
}

impl ResponseStatus {
    /// Status a failed engine operation is reported with.
    pub fn for_error(err: &EngineError) -> Self {
        match err {
            EngineError::ResourceNotFound(_) => ResponseStatus::NotFound,
            EngineError::InvalidRequest(_) => ResponseStatus::InvalidCommand,
            EngineError::MalformedManifest(_)
            | EngineError::DeliveryFailure { .. }
            | EngineError::StoreUnavailable(_) => ResponseStatus::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON format: {0}")]
    InvalidJson(String),
    #[error("Message of {size} bytes exceeds limit of {limit}")]
    MessageTooLarge { size: usize, limit: usize },
    #[error("Serialization failed: {0}")]
    Serialization(String),
    #[error("Invalid command: {0}")]
    InvalidCommand(String),
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

/// Line codec for the newline-delimited JSON protocol.
#[derive(Debug)]
pub struct ProtocolHandler {
    max_line_bytes: usize,
    command_counter: u32,
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_BYTES)
    }
}

impl ProtocolHandler {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            max_line_bytes,
            command_counter: 0,
        }
    }

    pub fn max_line_bytes(&self) -> usize {
        self.max_line_bytes
    }

    pub fn parse_command(&self, line: &str) -> Result<Command, ProtocolError> {
        self.check_size(line.len())?;
        let command: Command =
            serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        self.validate_command(&command)?;
        Ok(command)
    }

    pub fn parse_response(&self, line: &str) -> Result<CommandResponse, ProtocolError> {
        self.check_size(line.len())?;
        serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn parse_message(&self, line: &str) -> Result<HubMessage, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::InvalidJson(e.to_string()))
    }

    pub fn serialize_command(&self, command: &Command) -> Result<String, ProtocolError> {
        serde_json::to_string(command).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        serde_json::to_string(response).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn serialize_message(&self, message: &HubMessage) -> Result<String, ProtocolError> {
        serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    fn check_size(&self, size: usize) -> Result<(), ProtocolError> {
        if size > self.max_line_bytes {
            return Err(ProtocolError::MessageTooLarge {
                size,
                limit: self.max_line_bytes,
            });
        }
        Ok(())
    }

    pub fn validate_command(&self, command: &Command) -> Result<(), ProtocolError> {
        if command.id == 0 {
            return Err(ProtocolError::InvalidCommand("command id must be non-zero".to_string()));
        }

        match &command.command_type {
            CommandType::Deploy { manifest } if manifest.trim().is_empty() => {
                Err(ProtocolError::InvalidParameter("manifest is empty".to_string()))
            }
            CommandType::GetResource { name, .. } | CommandType::DeleteResource { name, .. }
                if name.is_empty() =>
            {
                Err(ProtocolError::InvalidParameter("resource name is empty".to_string()))
            }
            CommandType::InjectIncident { service, scenario }
                if service.is_empty() || scenario.is_empty() =>
            {
                Err(ProtocolError::InvalidParameter(
                    "service and scenario are required".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn create_command(&mut self, command_type: CommandType) -> Command {
        Command {
            id: self.next_command_id(),
            timestamp: now_millis(),
            command_type,
        }
    }

    pub fn create_response(
        &self,
        command_id: u32,
        status: ResponseStatus,
        message: Option<&str>,
        data: Option<Value>,
    ) -> CommandResponse {
        CommandResponse {
            id: command_id,
            timestamp: now_millis(),
            status,
            message: message.map(str::to_string),
            data,
        }
    }

    /// Response for a line that could not be turned into a command.
    pub fn parse_error_response(&self, err: &ProtocolError) -> CommandResponse {
        self.create_response(0, ResponseStatus::ParseError, Some(&err.to_string()), None)
    }

    pub fn next_command_id(&mut self) -> u32 {
        self.command_counter = self.command_counter.wrapping_add(1);
        if self.command_counter == 0 {
            self.command_counter = 1;
        }
        self.command_counter
    }
}
