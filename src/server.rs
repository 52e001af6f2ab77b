use crate::{
    config::Config, coordinator::CgiCoordinator, error::error_response, request::CgiRequest,
    router::Router,
};
use hyper::{
    server::conn::AddrStream,
    service::{make_service_fn, service_fn},
    Body, Request, Response, Server, StatusCode,
};
use log::{debug, info};
use std::{convert::Infallible, net::SocketAddr, sync::Arc};

/// Shared by every connection.
pub struct Gateway {
    router: Router,
    coordinator: CgiCoordinator,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        Gateway {
            router: Router::new(config),
            coordinator: CgiCoordinator::new(config),
        }
    }

    pub async fn handle(&self, req: Request<Body>, remote_addr: SocketAddr) -> Response<Body> {
        let target = match self.router.resolve(req.uri().path()) {
            Some(target) => target,
            None => {
                debug!("{} {}: no script", req.method(), req.uri());
                return error_response(StatusCode::NOT_FOUND);
            }
        };

        let method = req.method().clone();
        let uri = req.uri().clone();
        let res = self
            .coordinator
            .handle(CgiRequest::from_hyper(req, remote_addr), &target)
            .await;
        info!("{} {} {} -> {}", remote_addr, method, uri, res.status());
        res
    }
}

pub async fn run(config: Config) -> Result<(), hyper::Error> {
    let addr = config.listen;
    let gateway = Arc::new(Gateway::new(&config));

    let server = Server::try_bind(&addr)?.serve(make_service_fn(move |conn: &AddrStream| {
        let remote_addr = conn.remote_addr();
        let gateway = gateway.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let gateway = gateway.clone();
                async move { Ok::<_, Infallible>(gateway.handle(req, remote_addr).await) }
            }))
        }
    }));

    info!("listening on http://{}", addr);
    server.await
}
