use std::sync::Arc;
use std::time::Duration;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use kube::Client;
use prometheus::{Encoder, TextEncoder};
use tokio::signal::unix::{signal, SignalKind};
use vipd_net::addr::NetlinkAddressManager;
use vipd_net::arp::ArpAdvertiser;
use vipd_net::bgp::{BgpAdvertiser, GrpcSpeaker, Speaker};
use vipd_net::route::RouteAdvertiser;
use vipd_net::{AddressManager, Advertiser};
use vipd_trace::init::{prepare_tracing, TraceConfig};

use crate::config::{Config, ElectionTopology};
use crate::context::{Scope, State};
use crate::controller::ServiceController;
use crate::election::{ElectionBackend, KubeElections};
use crate::endpoints::{EndpointBackend, KubeEndpoints};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::registry::InstanceRegistry;
use crate::watcher::{KubeServiceWatcher, ServiceEventSource};

pub fn start(config: Config, trace: TraceConfig) {
    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(config, trace));
    std::process::exit(code);
}

async fn run(config: Config, trace_config: TraceConfig) -> i32 {
    prepare_tracing(trace_config).await;

    if let Err(e) = config.validate() {
        tracing::error!(error=%e, "refusing to start with an invalid configuration");
        return 1;
    }
    let config = Arc::new(config);

    let state = State::new("vipd-agent");
    let metrics = match Metrics::new(&config.metrics_namespace).register(&state.registry) {
        Ok(metrics) => metrics,
        Err(e) => {
            tracing::error!(error=%e, "failed to register metrics");
            return 1;
        }
    };

    let client = match Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            tracing::error!(error=%e, "failed to create the Kubernetes client");
            return 1;
        }
    };

    let addresses = AddressManager::Netlink(NetlinkAddressManager::new(
        &config.interface,
        config.prefix_v4,
        config.prefix_v6,
    ));
    let advertiser = if config.enable_arp {
        Advertiser::Arp(ArpAdvertiser::new(
            &config.interface,
            Duration::from_secs(config.arp_interval.max(1)),
        ))
    } else if config.enable_routing_table {
        Advertiser::Route(RouteAdvertiser::new(
            &config.interface,
            config.routing_table_id,
            config.prefix_v4,
            config.prefix_v6,
        ))
    } else {
        Advertiser::Bgp(BgpAdvertiser::new(
            Speaker::Grpc(GrpcSpeaker::new(
                &config.bgp_speaker_endpoint,
                Duration::from_secs(config.bgp_speaker_timeout),
            )),
            config.prefix_v4,
            config.prefix_v6,
            config.bgp_bind_addresses,
        ))
    };

    let root = Scope::new();
    let controller_scope = root.child();

    let elections = ElectionBackend::Kube(KubeElections {
        client: client.clone(),
        namespace: config.lease_namespace.clone(),
        holder: config.node_name.clone(),
        lease_duration: config.lease_duration,
        renew_interval: config.lease_renew_interval,
    });
    let global_election = match config.election_topology() {
        ElectionTopology::Global => {
            Some(elections.watch(&controller_scope, &config.lease_name))
        }
        _ => None,
    };

    let controller = ServiceController::new(
        config.clone(),
        controller_scope,
        Arc::new(InstanceRegistry::default()),
        ServiceEventSource::Kube(KubeServiceWatcher::new(
            client.clone(),
            &config.service_namespace,
        )),
        addresses,
        advertiser.clone(),
        elections,
        global_election,
        EndpointBackend::Kube(KubeEndpoints {
            client,
            use_slices: config.enable_endpoint_slices,
            node_name: config.node_name.clone(),
        }),
        metrics,
    );
    let mut controller_task = tokio::spawn(controller.run());

    let server_state = state.clone();
    let server = match HttpServer::new(move || {
        App::new()
            .app_data(Data::new(server_state.clone()))
            .service(index)
            .service(health)
            .service(ready)
            .service(metrics_)
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz"),
            )
    })
    .bind(("0.0.0.0", config.http_port))
    {
        Ok(server) => server.shutdown_timeout(5),
        Err(e) => {
            tracing::error!(error=%e, port = config.http_port, "failed to bind the HTTP server");
            return 1;
        }
    };
    tokio::spawn(server.run());

    tracing::info!(
        node = config.node_name,
        port = config.http_port,
        "agent is running"
    );

    let code = tokio::select! {
        res = &mut controller_task => finish(res),
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, draining the load balancers");
            root.cancel();
            tokio::select! {
                res = &mut controller_task => finish(res),
                _ = shutdown_signal() => {
                    tracing::warn!("second shutdown signal, exiting immediately");
                    1
                }
            }
        }
    };
    advertiser.stop();
    code
}

fn finish(res: Result<Result<(), Error>, tokio::task::JoinError>) -> i32 {
    match res {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::error!(error=%e, "service controller failed");
            1
        }
        Err(e) => {
            tracing::error!(error=%e, "service controller panicked");
            1
        }
    }
}

async fn shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install the signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&metrics, &mut buffer).unwrap();
    HttpResponse::Ok().body(buffer)
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
