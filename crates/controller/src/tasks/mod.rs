use crate::crds::DumpRequest;
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod dump;
pub mod exec;
pub mod store;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use types::{Context, Error, Result, DUMP_FINALIZER_NAME};

use dump::DumpReconciler;
use exec::KubePodExec;
use store::KubeDumpStore;

/// Wire the Kubernetes-backed store and exec capability into a shared context
#[must_use]
pub fn build_context(client: Client, config: ControllerConfig) -> Arc<Context> {
    let config = Arc::new(config);
    let store = Arc::new(KubeDumpStore::new(client.clone()));
    let exec = Arc::new(KubePodExec::new(
        client.clone(),
        config.dump.exec_timeout(),
    ));
    let reconciler = Arc::new(DumpReconciler::new(store, exec, config.clone()));

    Arc::new(Context {
        client,
        config,
        reconciler,
    })
}

fn dump_api(client: Client, namespace: Option<&str>) -> Api<DumpRequest> {
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Main entry point for the DumpRequest controller
#[instrument(skip(context), fields(namespace = ?context.config.controller.watch_namespace))]
pub async fn run_dump_controller(context: Arc<Context>) -> Result<()> {
    let watch_namespace = context.config.controller.watch_namespace.clone();
    info!(
        "Starting DumpRequest controller (namespace: {})",
        watch_namespace.as_deref().unwrap_or("<all>")
    );

    let dumps = dump_api(context.client.clone(), watch_namespace.as_deref());

    // Startup visibility: list existing DumpRequests so we can see what the controller should observe
    match dumps.list(&ListParams::default()).await {
        Ok(list) => {
            info!(
                "Controller startup: found {} DumpRequest(s)",
                list.items.len()
            );
            for dump in list.items {
                debug!(
                    "Existing DumpRequest: {}, pod={}, terminal={}",
                    dump.object_key(),
                    dump.spec.pod_name,
                    dump.is_terminal()
                );
            }
        }
        Err(e) => {
            error!("Failed to list DumpRequests at startup: {}", e);
        }
    }

    let watcher_config = Config::default().any_semantic();
    let controller_config =
        controller::Config::default().concurrency(context.config.controller.concurrency);

    Controller::new(dumps, watcher_config)
        .with_config(controller_config)
        .run(reconcile_dump_request, error_policy, context)
        .for_each(|reconciliation_result| {
            let dump_span = tracing::info_span!("dump_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((object_ref, action)) => {
                        debug!(
                            resource = %object_ref,
                            action = ?action,
                            "DumpRequest reconciliation successful"
                        );
                    }
                    Err(reconciliation_err) => {
                        warn!(
                            error = ?reconciliation_err,
                            "DumpRequest reconciliation error"
                        );
                    }
                }
            }
            .instrument(dump_span)
        })
        .await;

    info!("DumpRequest controller shutting down");
    Ok(())
}

#[instrument(skip(ctx), fields(dump_request = %dump.object_key()))]
pub async fn reconcile_dump_request(dump: Arc<DumpRequest>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = dump.namespace().ok_or(Error::MissingObjectKey)?;
    let dumps: Api<DumpRequest> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&dumps, DUMP_FINALIZER_NAME, dump, |event| async {
        match event {
            FinalizerEvent::Apply(dump) => ctx
                .reconciler
                .reconcile(&dump)
                .await
                .map(dump::ReconcileOutcome::into_action),
            FinalizerEvent::Cleanup(dump) => {
                info!("DumpRequest deleted, dropping controller state");
                ctx.reconciler.forget(&dump.object_key());
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err) => err,
        kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::KubeError(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    })
}

/// Transient failures are retried with per-resource exponential backoff
fn error_policy(dump: Arc<DumpRequest>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = dump.object_key();
    let delay = ctx.reconciler.backoff_for(&key);
    warn!(
        error = %err,
        dump_request = %key,
        retry_in_secs = delay.as_secs(),
        "DumpRequest reconciliation failed, requeueing"
    );
    Action::requeue(delay)
}
