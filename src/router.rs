use crate::{
    config::{Config, RouteConfig},
    process::ScriptCommand,
};
use log::debug;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// A URL resolved to a script, ready for the gateway.
#[derive(Debug, Clone)]
pub struct ScriptTarget {
    /// URL path of the script itself, e.g. `/cgi-bin/guest_book.py`.
    pub script_name: String,
    /// URL remainder after the script, e.g. `/extra/path`, or empty.
    pub path_info: String,
    /// Directory the route maps onto.
    pub root: PathBuf,
    pub script_path: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub working_dir: PathBuf,
    pub timeout: Duration,
}

impl ScriptTarget {
    pub fn command(&self) -> ScriptCommand {
        ScriptCommand {
            script_path: self.script_path.clone(),
            interpreter: self.interpreter.clone(),
            working_dir: self.working_dir.clone(),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| format!(".{}", ext))
}

pub struct Router {
    routes: Vec<RouteConfig>,
    default_timeout: Duration,
}

impl Router {
    pub fn new(config: &Config) -> Self {
        let mut routes = config.routes.clone();
        // Longest prefix wins.
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Router {
            routes,
            default_timeout: config.timeout(),
        }
    }

    pub fn resolve(&self, path: &str) -> Option<ScriptTarget> {
        self.routes
            .iter()
            .filter_map(|route| Some((route, strip_route(&route.prefix, path)?)))
            .find_map(|(route, rest)| self.resolve_in(route, rest))
    }

    fn resolve_in(&self, route: &RouteConfig, rest: &str) -> Option<ScriptTarget> {
        let segments = rest
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<&str>>();
        if segments.iter().any(|segment| *segment == "..") {
            debug!("refusing path traversal in {:?}", rest);
            return None;
        }

        let mut script_path = route.root.clone();
        for (idx, segment) in segments.iter().enumerate() {
            script_path.push(segment);
            if script_path.is_file() {
                let base = route.prefix.trim_end_matches('/');
                let script_name = format!("{}/{}", base, segments[..=idx].join("/"));
                let path_info = match &segments[idx + 1..] {
                    [] => String::default(),
                    tail => format!("/{}", tail.join("/")),
                };
                return self.target(route, script_name, path_info, script_path);
            }
            if !script_path.is_dir() {
                return None;
            }
        }
        None
    }

    fn target(
        &self,
        route: &RouteConfig,
        script_name: String,
        path_info: String,
        script_path: PathBuf,
    ) -> Option<ScriptTarget> {
        let script_path = std::fs::canonicalize(&script_path).ok()?;

        let interpreter = if route.interpreters.is_empty() {
            None
        } else {
            let ext = extension(&script_path)?;
            match route.interpreters.get(&ext) {
                Some(interpreter) => Some(interpreter.clone()),
                None => {
                    debug!("{} is not a CGI extension here", ext);
                    return None;
                }
            }
        };

        let working_dir = match &route.working_dir {
            Some(dir) => dir.clone(),
            None => script_path.parent()?.to_owned(),
        };

        Some(ScriptTarget {
            script_name,
            path_info,
            root: route.root.clone(),
            script_path,
            interpreter,
            working_dir,
            timeout: route
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout),
        })
    }
}

/// Path below `prefix`, matching on segment boundaries only.
fn strip_route<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('/');
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}
