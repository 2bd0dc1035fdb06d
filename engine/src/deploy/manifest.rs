//! Declarative resource descriptions for the container orchestrator
//!
//! Resource names derive from the app name:
//!
//! | target    | deployment      | selector labels          |
//! |-----------|-----------------|--------------------------|
//! | rolling   | `app`           | `app`                    |
//! | recreate  | `app`           | `app`                    |
//! | blue      | `app-blue`      | `app`, `color=blue`      |
//! | green     | `app-green`     | `app`, `color=green`     |
//! | canary    | `app-canary`    | `app`, `track=canary`    |
//! | promote   | `app`           | `app`, `track=stable`    |
//!
//! The routing service is always named `app`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::settings::{ClusterSettings, RegistrySettings};
use crate::config::DeploymentConfig;

/// Blue-green environment colour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    pub fn as_str(&self) -> &'static str {
        match self {
            Color::Blue => "blue",
            Color::Green => "green",
        }
    }

    pub fn other(&self) -> Color {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    pub fn parse(value: &str) -> Option<Color> {
        match value.trim() {
            "blue" => Some(Color::Blue),
            "green" => Some(Color::Green),
            _ => None,
        }
    }
}

/// What a manifest set deploys
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    /// Single deployment replaced incrementally
    Rolling,
    /// Single deployment replaced all at once
    Recreate,
    /// One colour of a blue-green pair
    Color(Color),
    /// Canary variant next to the stable one
    Canary,
    /// Stable variant of a canary rollout
    Promote,
}

/// A set of resources applied together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ManifestSet {
    pub items: Vec<Value>,
}

impl ManifestSet {
    pub fn push(&mut self, item: Value) {
        self.items.push(item);
    }

    /// `kind/name` of every resource
    pub fn names(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| {
                format!(
                    "{}/{}",
                    item["kind"].as_str().unwrap_or("Unknown"),
                    item["metadata"]["name"].as_str().unwrap_or("unnamed")
                )
            })
            .collect()
    }

    /// Find a resource by kind and name
    pub fn find(&self, kind: &str, name: &str) -> Option<&Value> {
        self.items
            .iter()
            .find(|item| item["kind"] == kind && item["metadata"]["name"] == name)
    }

    /// Single document for `kubectl apply -f -`
    pub fn to_apply_payload(&self) -> String {
        json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": self.items,
        })
        .to_string()
    }
}

/// Builds resource descriptions from configuration
#[derive(Debug, Clone)]
pub struct ManifestBuilder {
    app: String,
    environment: String,
    registry: RegistrySettings,
    cluster: ClusterSettings,
    grace_period_secs: u64,
}

impl ManifestBuilder {
    pub fn new(config: &DeploymentConfig) -> Self {
        Self {
            app: config.app_name().to_string(),
            environment: config.environment.clone(),
            registry: config.registry.clone(),
            cluster: config.cluster.clone(),
            grace_period_secs: config.timeouts.graceful_shutdown_secs,
        }
    }

    pub fn app(&self) -> &str {
        &self.app
    }

    pub fn namespace(&self) -> &str {
        &self.cluster.namespace
    }

    /// Termination grace period given to replaced pods
    pub fn grace_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_period_secs)
    }

    /// Deployment name of a target
    pub fn deployment_name(&self, target: Target) -> String {
        match target {
            Target::Rolling | Target::Recreate | Target::Promote => self.app.clone(),
            Target::Color(color) => format!("{}-{}", self.app, color.as_str()),
            Target::Canary => format!("{}-canary", self.app),
        }
    }

    /// Resources for a version deployed as `target`
    pub fn build(&self, version: &str, target: Target) -> ManifestSet {
        let mut set = ManifestSet::default();
        let name = self.deployment_name(target);

        match target {
            Target::Rolling => {
                let strategy = json!({
                    "type": "RollingUpdate",
                    "rollingUpdate": {
                        "maxSurge": int_or_percent(&self.cluster.max_surge),
                        "maxUnavailable": int_or_percent(&self.cluster.max_unavailable),
                    }
                });
                set.push(self.deployment(&name, version, &[], self.cluster.min_replicas, strategy));
                set.push(self.autoscaler(&name));
                set.push(self.service(&self.app, &[]));
            }
            Target::Recreate => {
                let strategy = json!({ "type": "Recreate" });
                set.push(self.deployment(&name, version, &[], self.cluster.min_replicas, strategy));
                set.push(self.autoscaler(&name));
                set.push(self.service(&self.app, &[]));
            }
            Target::Color(color) => {
                let extra = [("color", color.as_str())];
                set.push(self.deployment(
                    &name,
                    version,
                    &extra,
                    self.cluster.min_replicas,
                    rolling_default(),
                ));
                set.push(self.autoscaler(&name));
            }
            Target::Canary => {
                let extra = [("track", "canary")];
                set.push(self.deployment(
                    &name,
                    version,
                    &extra,
                    self.cluster.canary_replicas,
                    rolling_default(),
                ));
                set.push(self.service(&format!("{}-canary", self.app), &extra));
                set.push(self.service(&format!("{}-stable", self.app), &[("track", "stable")]));
                set.push(self.service(&self.app, &[]));
            }
            Target::Promote => {
                let extra = [("track", "stable")];
                set.push(self.deployment(
                    &name,
                    version,
                    &extra,
                    self.cluster.min_replicas,
                    rolling_default(),
                ));
                set.push(self.autoscaler(&name));
            }
        }

        set
    }

    /// Routing service pointing at one colour
    pub fn route_to(&self, color: Color) -> ManifestSet {
        ManifestSet {
            items: vec![self.service(&self.app, &[("color", color.as_str())])],
        }
    }

    /// Weighted split between the stable and canary services
    pub fn traffic_split(&self, canary_weight: f64) -> ManifestSet {
        let canary = (canary_weight.clamp(0.0, 1.0) * 100.0).round() as u32;
        ManifestSet {
            items: vec![json!({
                "apiVersion": "split.smi-spec.io/v1alpha2",
                "kind": "TrafficSplit",
                "metadata": self.metadata(&self.app, &[]),
                "spec": {
                    "service": self.app,
                    "backends": [
                        { "service": format!("{}-stable", self.app), "weight": 100 - canary },
                        { "service": format!("{}-canary", self.app), "weight": canary },
                    ]
                }
            })],
        }
    }

    fn labels(&self, extra: &[(&str, &str)]) -> Map<String, Value> {
        let mut labels = Map::new();
        labels.insert("app".to_string(), Value::from(self.app.as_str()));
        for (key, value) in extra {
            labels.insert(key.to_string(), Value::from(*value));
        }
        labels
    }

    fn metadata(&self, name: &str, extra: &[(&str, &str)]) -> Value {
        let mut labels = self.labels(extra);
        labels.insert("environment".to_string(), Value::from(self.environment.as_str()));
        labels.insert("app.kubernetes.io/managed-by".to_string(), Value::from("cutover"));
        json!({
            "name": name,
            "namespace": self.cluster.namespace,
            "labels": labels,
        })
    }

    fn deployment(
        &self,
        name: &str,
        version: &str,
        extra: &[(&str, &str)],
        replicas: u32,
        strategy: Value,
    ) -> Value {
        let selector = self.labels(extra);
        let mut pod_labels = selector.clone();
        pod_labels.insert("version".to_string(), Value::from(version));

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": self.metadata(name, extra),
            "spec": {
                "replicas": replicas,
                "selector": { "matchLabels": selector },
                "strategy": strategy,
                "template": {
                    "metadata": { "labels": pod_labels },
                    "spec": {
                        "terminationGracePeriodSeconds": self.grace_period_secs,
                        "containers": [{
                            "name": self.app,
                            "image": self.registry.image_ref(version),
                            "ports": [{ "containerPort": self.cluster.container_port }],
                        }]
                    }
                }
            }
        })
    }

    fn autoscaler(&self, deployment: &str) -> Value {
        json!({
            "apiVersion": "autoscaling/v2",
            "kind": "HorizontalPodAutoscaler",
            "metadata": self.metadata(deployment, &[]),
            "spec": {
                "scaleTargetRef": {
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": deployment,
                },
                "minReplicas": self.cluster.min_replicas,
                "maxReplicas": self.cluster.max_replicas,
                "metrics": [{
                    "type": "Resource",
                    "resource": {
                        "name": "cpu",
                        "target": {
                            "type": "Utilization",
                            "averageUtilization": self.cluster.target_cpu_percent,
                        }
                    }
                }]
            }
        })
    }

    fn service(&self, name: &str, extra: &[(&str, &str)]) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": self.metadata(name, &[]),
            "spec": {
                "selector": self.labels(extra),
                "ports": [{
                    "port": 80,
                    "targetPort": self.cluster.container_port,
                }]
            }
        })
    }
}

fn rolling_default() -> Value {
    json!({
        "type": "RollingUpdate",
        "rollingUpdate": { "maxSurge": "25%", "maxUnavailable": 0 }
    })
}

/// Kubernetes IntOrString
fn int_or_percent(value: &str) -> Value {
    value
        .trim()
        .parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(value.trim()))
}
