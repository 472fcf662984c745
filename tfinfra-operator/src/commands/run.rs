use std::sync::Arc;

use anyhow::{Context, Result};
use kube::api::ListParams;
use kube::Api;
use tfinfra_actuator::{Actuator, ActuatorConfig, AwsProviderFactory, KubeClientImpl, Terraformer};
use tfinfra_models::Infrastructure;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::controller;
use crate::health::{self, HealthState};

/// Run the controller with its health endpoints until SIGINT/SIGTERM
pub async fn run_operator(namespace: Option<String>, health_port: Option<u16>) -> Result<()> {
    let mut config = Config::load()?;
    if namespace.is_some() {
        config.watch_namespace = namespace;
    }
    if let Some(port) = health_port {
        config.health_port = port;
    }

    tracing::info!("Starting tfinfra operator");
    tracing::info!("Terraformer image: {}", config.terraformer.image);

    let client = tfinfra_actuator::k8s_client::get_k8s_client()
        .await
        .context("Failed to create Kubernetes client")?;

    // Fail fast when the CRD is missing
    let api: Api<Infrastructure> = match &config.watch_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    api.list(&ListParams::default().limit(1))
        .await
        .context("Cannot list Infrastructures; is the CRD installed? (tfinfra-operator crd | kubectl apply -f -)")?;

    let actuator = Actuator::new(ActuatorConfig {
        runner: Arc::new(Terraformer::new(client.clone())),
        kube: Arc::new(KubeClientImpl::new(client.clone())),
        provider: Some(Arc::new(AwsProviderFactory)),
        settings: config.terraformer.clone(),
    });

    let cancel = CancellationToken::new();
    let health = HealthState::default();

    let health_task = {
        let health = health.clone();
        let cancel = cancel.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            let result = health::start_server(port, health, cancel.clone()).await;
            if let Err(e) = &result {
                tracing::error!("Health server failed: {:#}", e);
                cancel.cancel();
            }
            result
        })
    };

    let signal_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(()) => tracing::info!("Received shutdown signal, stopping"),
                Err(e) => tracing::error!("Cannot listen for shutdown signals: {:#}", e),
            }
            cancel.cancel();
        })
    };

    let ctx = Arc::new(controller::Context {
        client,
        actuator,
        cancel: cancel.clone(),
    });
    controller::run(
        ctx,
        config.watch_namespace.as_deref(),
        config.max_concurrent_reconciles,
        health,
    )
    .await;

    cancel.cancel();
    signal_task.abort();
    health_task.await.context("Health server task panicked")??;

    tracing::info!("tfinfra operator stopped");
    Ok(())
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    Ok(())
}
