use std::collections::HashMap;

use async_trait::async_trait;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, info};

use kubepanel_types::{
    ContainerSelector, LogConnection, LogSource, StreamError, StreamOptions, StreamTarget,
};

use crate::client::KubeClient;

/// Lines buffered between the HTTP reader and the session
const LINE_CHANNEL_CAPACITY: usize = 1024;

/// Pod log source backed by the Kubernetes API
///
/// Targets carry their cluster context, so one source serves every panel;
/// a `kube::Client` is built lazily per context and reused.
pub struct KubeLogSource {
    kube: KubeClient,
    clients: Mutex<HashMap<String, kube::Client>>,
}

impl KubeLogSource {
    pub fn new(kube: KubeClient) -> Self {
        Self {
            kube,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Cached client for the target's context, created on first use
    async fn client_for(&self, target: &StreamTarget) -> Result<kube::Client, StreamError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&target.context) {
            return Ok(client.clone());
        }

        let client = self
            .kube
            .client_for_context(&target.context)
            .await
            .map_err(|e| StreamError::connection(target, format!("{:#}", e)))?;
        info!(context = %target.context, "created client for cluster context");
        clients.insert(target.context.clone(), client.clone());
        Ok(client)
    }

    /// Resolve which containers to stream and whether lines need a tag
    async fn resolve_containers(
        &self,
        pods: &Api<Pod>,
        target: &StreamTarget,
    ) -> Result<Vec<(String, bool)>, StreamError> {
        match &target.container {
            ContainerSelector::Named(name) => Ok(vec![(name.clone(), false)]),
            ContainerSelector::All => {
                let pod = pods
                    .get(&target.pod)
                    .await
                    .map_err(|e| classify_open_error(target, e))?;
                let names = container_names(&pod);
                if names.is_empty() {
                    return Err(StreamError::connection(target, "pod has no containers"));
                }
                let tagged = names.len() > 1;
                Ok(names.into_iter().map(|name| (name, tagged)).collect())
            }
        }
    }
}

#[async_trait]
impl LogSource for KubeLogSource {
    async fn open(
        &self,
        target: &StreamTarget,
        options: &StreamOptions,
    ) -> Result<LogConnection, StreamError> {
        let client = self.client_for(target).await?;
        let pods: Api<Pod> = Api::namespaced(client, &target.namespace);
        let containers = self.resolve_containers(&pods, target).await?;

        let requests: Vec<(LogParams, Option<String>)> = containers
            .into_iter()
            .map(|(container, tagged)| {
                // Same prefix kubectl emits for --prefix
                let tag = tagged.then(|| format!("[pod/{}/{}] ", target.pod, container));
                (log_params(options, Some(container)), tag)
            })
            .collect();

        let (line_tx, line_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let pod_name = target.pod.clone();
        let task_target = target.clone();

        let pump = tokio::spawn(async move {
            let mut streams = Vec::with_capacity(requests.len());

            for (params, tag) in &requests {
                match pods.log_stream(&pod_name, params).await {
                    Ok(reader) => {
                        let tag = tag.clone();
                        let lines = reader.lines().map(move |result| match result {
                            Ok(line) => Ok(match &tag {
                                Some(tag) => format!("{}{}", tag, line),
                                None => line,
                            }),
                            Err(e) => Err(StreamError::StreamInterrupted(e.to_string())),
                        });
                        streams.push(lines.boxed());
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(classify_open_error(&task_target, e)));
                        return;
                    }
                }
            }

            if ready_tx.send(Ok(())).is_err() {
                // Opener went away before the stream was wired up
                return;
            }

            let mut merged = futures::stream::select_all(streams);
            while let Some(item) = merged.next().await {
                if line_tx.send(item).await.is_err() {
                    // Connection destroyed, stop reading
                    break;
                }
            }
            debug!(stream = %task_target, "pod log stream closed");
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(LogConnection::from_channel(line_rx, pump)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StreamError::connection(
                target,
                "log stream task ended before connecting",
            )),
        }
    }
}

/// Map stream options onto the pod log API parameters
fn log_params(options: &StreamOptions, container: Option<String>) -> LogParams {
    LogParams {
        follow: options.follow,
        container,
        tail_lines: options.tail_lines,
        timestamps: options.timestamps,
        previous: options.previous,
        ..Default::default()
    }
}

/// Container names declared in the pod spec
fn container_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
        .unwrap_or_default()
}

/// Classify a failure to open a stream; none of these are retried on start
fn classify_open_error(target: &StreamTarget, err: kube::Error) -> StreamError {
    match err {
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => {
            StreamError::permission(target, resp.message)
        }
        kube::Error::Api(resp) => StreamError::connection(target, resp.message),
        other => StreamError::connection(target, other.to_string()),
    }
}
