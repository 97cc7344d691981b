//! Plugin control-plane handlers: multipart load and swap, unload,
//! listings, metadata, and artifact download.

use crate::api::{error_response, kind_error_response, success_response};
use crate::logging::TraceId;
use crate::state::AppState;
use axum::extract::{Extension, Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use flate2::write::GzEncoder;
use flate2::Compression;
use oxtel_common::types::{AvailablePluginInfo, LoadedPluginInfo, PluginId, PluginType};
use oxtel_control::artifact;
use serde::Serialize;
use std::collections::HashMap;
use std::io::Write as _;

#[derive(Serialize, Default)]
pub struct PluginListResponse {
    pub loaded_plugins: Vec<LoadedPluginInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub available_plugins: Vec<AvailablePluginInfo>,
}

#[derive(Serialize)]
pub struct SwapResponse {
    pub loaded_plugin: LoadedPluginInfo,
    pub unloaded_plugin: LoadedPluginInfo,
}

struct Upload {
    filename: String,
    bytes: Vec<u8>,
    signature: Option<Vec<u8>>,
}

/// Read the multipart upload: exactly one or two parts, the binary
/// first, an optional `.asc` signature second.
async fn read_upload(
    trace_id: &str,
    headers: &HeaderMap,
    multipart: &mut Multipart,
) -> Result<Upload, Response> {
    let gzipped = headers
        .get("Plugin-Compression")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));

    let mut binary: Option<(String, Vec<u8>)> = None;
    let mut signature: Option<Vec<u8>> = None;
    let mut index = 0usize;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    trace_id,
                    "bad_request",
                    &format!("unreadable multipart body: {e}"),
                ))
            }
        };
        let filename = field.file_name().unwrap_or("plugin").to_string();
        let data = match field.bytes().await {
            Ok(data) => data.to_vec(),
            Err(e) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    trace_id,
                    "bad_request",
                    &format!("unreadable multipart part: {e}"),
                ))
            }
        };
        let data = if gzipped {
            match artifact::gunzip(&data) {
                Ok(data) => data,
                Err(e) => {
                    return Err(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        trace_id,
                        "internal_error",
                        &format!("bad gzip payload: {e}"),
                    ))
                }
            }
        } else {
            data
        };

        match index {
            0 => {
                if filename.ends_with(".asc") {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        trace_id,
                        "bad_request",
                        "first file passed to load plugin api cannot be a signature file",
                    ));
                }
                binary = Some((filename, data));
            }
            1 => {
                if !filename.ends_with(".asc") {
                    return Err(error_response(
                        StatusCode::BAD_REQUEST,
                        trace_id,
                        "bad_request",
                        "second file passed was not a signature file",
                    ));
                }
                signature = Some(data);
            }
            _ => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    trace_id,
                    "bad_request",
                    "more than two files passed to the load plugin api",
                ))
            }
        }
        index += 1;
    }

    let Some((filename, bytes)) = binary else {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            "no plugin binary in upload",
        ));
    };
    Ok(Upload {
        filename,
        bytes,
        signature,
    })
}

pub async fn load_plugin(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let upload = match read_upload(&trace_id, &headers, &mut multipart).await {
        Ok(upload) => upload,
        Err(response) => return response,
    };

    match state
        .catalog
        .load(&upload.filename, &upload.bytes, upload.signature.as_deref())
        .await
    {
        Ok(info) => success_response(StatusCode::CREATED, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

fn parse_identity(
    trace_id: &str,
    plugin_type: &str,
    name: &str,
    version: &str,
) -> Result<PluginId, Response> {
    let plugin_type: PluginType = plugin_type.parse().map_err(|e: String| {
        error_response(StatusCode::BAD_REQUEST, trace_id, "bad_request", &e)
    })?;
    if name.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            trace_id,
            "bad_request",
            "missing plugin name",
        ));
    }
    let version: u32 = version.parse().map_err(|_| {
        error_response(StatusCode::BAD_REQUEST, trace_id, "bad_request", "invalid version")
    })?;
    Ok(PluginId::new(plugin_type, name, version))
}

pub async fn swap_plugin(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((plugin_type, name, version)): Path<(String, String, String)>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    let old = match parse_identity(&trace_id, &plugin_type, &name, &version) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let upload = match read_upload(&trace_id, &headers, &mut multipart).await {
        Ok(upload) => upload,
        Err(response) => return response,
    };

    match state
        .catalog
        .swap(&old, &upload.filename, &upload.bytes, upload.signature.as_deref())
        .await
    {
        Ok((loaded, unloaded)) => success_response(
            StatusCode::CREATED,
            &trace_id,
            SwapResponse {
                loaded_plugin: loaded,
                unloaded_plugin: unloaded,
            },
        ),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

pub async fn unload_plugin(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((plugin_type, name, version)): Path<(String, String, String)>,
) -> Response {
    let id = match parse_identity(&trace_id, &plugin_type, &name, &version) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.catalog.unload(&id).await {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}

fn list_response(
    state: &AppState,
    details: bool,
    type_filter: Option<PluginType>,
    name_filter: Option<&str>,
) -> PluginListResponse {
    let mut loaded = state.catalog.list();
    if let Some(t) = type_filter {
        loaded.retain(|p| p.id.plugin_type == t);
    }
    if let Some(name) = name_filter {
        loaded.retain(|p| p.id.name == name);
    }

    let mut available = Vec::new();
    if details {
        available = state.catalog.available();
        if let Some(t) = type_filter {
            available.retain(|p| p.id.plugin_type == t);
        }
        if let Some(name) = name_filter {
            available.retain(|p| p.id.name == name);
        }
    }
    PluginListResponse {
        loaded_plugins: loaded,
        available_plugins: available,
    }
}

pub async fn list_plugins(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let details = query.contains_key("details");
    success_response(
        StatusCode::OK,
        &trace_id,
        list_response(&state, details, None, None),
    )
}

pub async fn list_plugins_by_type(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path(plugin_type): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let plugin_type: PluginType = match plugin_type.parse() {
        Ok(t) => t,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", &e)
        }
    };
    let details = query.contains_key("details");
    success_response(
        StatusCode::OK,
        &trace_id,
        list_response(&state, details, Some(plugin_type), None),
    )
}

pub async fn list_plugins_by_name(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((plugin_type, name)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let plugin_type: PluginType = match plugin_type.parse() {
        Ok(t) => t,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, &trace_id, "bad_request", &e)
        }
    };
    let details = query.contains_key("details");
    success_response(
        StatusCode::OK,
        &trace_id,
        list_response(&state, details, Some(plugin_type), Some(&name)),
    )
}

pub async fn get_plugin(
    Extension(trace_id): Extension<TraceId>,
    State(state): State<AppState>,
    Path((plugin_type, name, version)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let id = match parse_identity(&trace_id, &plugin_type, &name, &version) {
        Ok(id) => id,
        Err(response) => return response,
    };

    let download = query
        .get("download")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    if download {
        let bytes = match state.catalog.read_artifact(&id) {
            Ok(bytes) => bytes,
            Err(e) => return kind_error_response(&trace_id, e.kind(), &e.to_string()),
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        if encoder.write_all(&bytes).is_err() {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &trace_id,
                "internal_error",
                "failed to compress artifact",
            );
        }
        let compressed = match encoder.finish() {
            Ok(compressed) => compressed,
            Err(e) => {
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &trace_id,
                    "internal_error",
                    &e.to_string(),
                )
            }
        };
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CONTENT_ENCODING, "gzip"),
            ],
            compressed,
        )
            .into_response();
    }

    match state.catalog.get_info(&id) {
        Ok(info) => success_response(StatusCode::OK, &trace_id, info),
        Err(e) => kind_error_response(&trace_id, e.kind(), &e.to_string()),
    }
}
