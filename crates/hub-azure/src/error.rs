use azure_core::error::ErrorKind as CoreErrorKind;
use azure_core::http::StatusCode;
use azure_messaging_eventhubs::error::ErrorKind;
use azure_messaging_eventhubs::EventHubsError;
use hub_contract::HubError;

pub(crate) fn from_core(err: &azure_core::Error) -> HubError {
    let detail = err.to_string();
    match err.kind() {
        CoreErrorKind::Credential => HubError::Unauthorized { detail },
        CoreErrorKind::HttpResponse {
            status: StatusCode::Unauthorized | StatusCode::Forbidden,
            ..
        } => HubError::Unauthorized { detail },
        CoreErrorKind::HttpResponse {
            status: StatusCode::NotFound,
            ..
        } => HubError::NotFound { detail },
        CoreErrorKind::DataConversion => HubError::InvalidRequest { detail },
        _ => HubError::Transport { detail },
    }
}

pub(crate) fn from_eventhubs(err: EventHubsError) -> HubError {
    match &err.kind {
        ErrorKind::AzureCore(core) => from_core(core),
        ErrorKind::ConsumerDisconnected(_) => HubError::closed(err.to_string()),
        ErrorKind::SendRejected(_) => HubError::InvalidRequest {
            detail: err.to_string(),
        },
        _ => HubError::transport(err.to_string()),
    }
}
