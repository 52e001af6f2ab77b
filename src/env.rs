//! Translation of a request into the CGI/1.1 meta-variables.

use crate::{body::BodyLength, error::CgiError, request::RequestHead, router::ScriptTarget};
use hyper::{header, http::uri::Authority};
use log::warn;

/// Variables every script gets, even when the value is empty.
pub const REQUIRED_VARS: [&str; 12] = [
    "REQUEST_METHOD",
    "SERVER_NAME",
    "SERVER_PORT",
    "SERVER_PROTOCOL",
    "SERVER_SOFTWARE",
    "GATEWAY_INTERFACE",
    "SCRIPT_NAME",
    "PATH_INFO",
    "QUERY_STRING",
    "CONTENT_TYPE",
    "CONTENT_LENGTH",
    "REMOTE_ADDR",
];

/// Static facts about the server that end up in `SERVER_*`.
#[derive(Debug, Clone)]
pub struct ServerMeta {
    pub server_name: Option<String>,
    pub server_port: u16,
    pub server_software: String,
}

/// Ordered name/value pairs handed, unmodified, to exactly one child.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    vars: Vec<(String, String)>,
}

impl CgiEnvironment {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn set(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), CgiError> {
        let name = name.into();
        let value = value.into();
        if name.is_empty() || name.contains(['=', '\0']) || value.contains('\0') {
            return Err(CgiError::Configuration(format!(
                "refusing environment entry {:?}",
                name
            )));
        }
        match self.vars.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.vars.push((name, value)),
        }
        Ok(())
    }
}

pub struct EnvironmentBuilder<'a> {
    meta: &'a ServerMeta,
    pass_env: &'a [String],
}

impl<'a> EnvironmentBuilder<'a> {
    pub fn new(meta: &'a ServerMeta, pass_env: &'a [String]) -> Self {
        EnvironmentBuilder { meta, pass_env }
    }

    /// `length` is the decoded body length: `Streaming` leaves
    /// `CONTENT_LENGTH` out so the script reads until end of input.
    pub fn build(
        &self,
        req: &RequestHead,
        target: &ScriptTarget,
        length: BodyLength,
    ) -> Result<CgiEnvironment, CgiError> {
        if target.script_path.as_os_str().is_empty() {
            return Err(CgiError::Configuration("no script path for route".into()));
        }

        let server_name = self
            .meta
            .server_name
            .clone()
            .filter(|name| !name.is_empty())
            .or_else(|| {
                req.headers
                    .get(header::HOST)
                    .and_then(|val| val.to_str().ok())
                    .and_then(|host| host.parse::<Authority>().ok())
                    .map(|authority| authority.host().to_owned())
            })
            .ok_or_else(|| CgiError::Configuration("server name is not configured".into()))?;

        let mut env = CgiEnvironment::default();

        for name in self.pass_env {
            if let Ok(value) = std::env::var(name) {
                env.set(name.as_str(), value)?;
            }
        }

        let script_filename = target.script_path.to_string_lossy().into_owned();
        let request_uri = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_owned())
            .unwrap_or_else(|| req.path().to_owned());

        env.set("GATEWAY_INTERFACE", "CGI/1.1")?;
        env.set("SERVER_SOFTWARE", self.meta.server_software.as_str())?;
        env.set("SERVER_NAME", server_name)?;
        env.set("SERVER_PORT", self.meta.server_port.to_string())?;
        env.set("SERVER_PROTOCOL", format!("{:?}", req.version))?;
        env.set("REQUEST_METHOD", req.method.as_str().to_ascii_uppercase())?;
        env.set("REQUEST_URI", request_uri)?;
        env.set("SCRIPT_NAME", target.script_name.as_str())?;
        env.set("SCRIPT_FILENAME", script_filename.as_str())?;
        env.set("PATH_INFO", target.path_info.as_str())?;
        if !target.path_info.is_empty() {
            let translated = target.root.join(target.path_info.trim_start_matches('/'));
            env.set("PATH_TRANSLATED", translated.to_string_lossy())?;
        }
        env.set("QUERY_STRING", req.query())?;
        env.set(
            "CONTENT_TYPE",
            req.headers
                .get(header::CONTENT_TYPE)
                .map(|val| String::from_utf8_lossy(val.as_bytes()).into_owned())
                .unwrap_or_default(),
        )?;
        match length {
            BodyLength::Empty => env.set("CONTENT_LENGTH", "")?,
            BodyLength::Exact(len) => env.set("CONTENT_LENGTH", len.to_string())?,
            BodyLength::Streaming => {}
        }
        env.set("REMOTE_ADDR", req.remote_addr.ip().to_string())?;
        env.set("REMOTE_HOST", req.remote_addr.ip().to_string())?;
        env.set("REMOTE_PORT", req.remote_addr.port().to_string())?;
        env.set("REDIRECT_STATUS", "200")?;

        for name in req.headers.keys() {
            // `x_a` would land on the same variable as `x-a`.
            if name.as_str().contains('_') {
                warn!("not passing header {} to script: underscore in name", name);
                continue;
            }
            let value = req
                .headers
                .get_all(name)
                .iter()
                .map(|val| String::from_utf8_lossy(val.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ");
            let name = format!("HTTP_{}", name)
                .replace('-', "_")
                .to_ascii_uppercase();
            env.set(name, value)?;
        }

        for required in REQUIRED_VARS {
            if required == "CONTENT_LENGTH" && length == BodyLength::Streaming {
                continue;
            }
            if !env.contains(required) {
                return Err(CgiError::Configuration(format!("{} was not set", required)));
            }
        }

        Ok(env)
    }
}
