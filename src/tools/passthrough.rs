//! Read-only catalog tools that forward a GET and return the platform's JSON.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{parse_args, Id, Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry};

/// A GET endpoint exposed as a tool. `{id}` in the path is filled from the
/// argument named by `id_arg`.
struct Endpoint {
    name: &'static str,
    description: &'static str,
    path: &'static str,
    id_arg: Option<&'static str>,
    /// Accepts Superset's rison `q` filter.
    listing: bool,
}

static ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        name: "analytics_dashboard_list",
        description: "List dashboards.",
        path: "/dashboard/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_dashboard_get_by_id",
        description: "Get one dashboard's metadata and layout.",
        path: "/dashboard/{id}",
        id_arg: Some("dashboard_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_chart_list",
        description: "List charts.",
        path: "/chart/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_chart_get_by_id",
        description: "Get one chart's configuration.",
        path: "/chart/{id}",
        id_arg: Some("chart_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_database_list",
        description: "List database connections. Their ids are the database_id for SQL Lab tools.",
        path: "/database/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_database_get_by_id",
        description: "Get one database connection's settings.",
        path: "/database/{id}",
        id_arg: Some("database_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_database_get_tables",
        description: "List the tables of a database connection.",
        path: "/database/{id}/tables/",
        id_arg: Some("database_id"),
        listing: true,
    },
    Endpoint {
        name: "analytics_database_schemas",
        description: "List the schemas of a database connection.",
        path: "/database/{id}/schemas/",
        id_arg: Some("database_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_dataset_list",
        description: "List datasets.",
        path: "/dataset/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_dataset_get_by_id",
        description: "Get one dataset's columns and metrics.",
        path: "/dataset/{id}",
        id_arg: Some("dataset_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_saved_query_list",
        description: "List saved SQL Lab queries.",
        path: "/saved_query/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_saved_query_get_by_id",
        description: "Get one saved SQL Lab query.",
        path: "/saved_query/{id}",
        id_arg: Some("saved_query_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_query_list",
        description: "List the SQL Lab query history.",
        path: "/query/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_query_get_by_id",
        description: "Get one entry of the SQL Lab query history.",
        path: "/query/{id}",
        id_arg: Some("query_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_tag_list",
        description: "List tags.",
        path: "/tag/",
        id_arg: None,
        listing: true,
    },
    Endpoint {
        name: "analytics_tag_get_by_id",
        description: "Get one tag.",
        path: "/tag/{id}",
        id_arg: Some("tag_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_menu_get",
        description: "Get the platform's navigation menu for the current user.",
        path: "/menu/",
        id_arg: None,
        listing: false,
    },
    Endpoint {
        name: "analytics_user_get_current",
        description: "Get the profile of the authenticated user.",
        path: "/me/",
        id_arg: None,
        listing: false,
    },
    Endpoint {
        name: "analytics_user_get_roles",
        description: "Get the roles of the authenticated user.",
        path: "/me/roles/",
        id_arg: None,
        listing: false,
    },
    Endpoint {
        name: "analytics_activity_get_recent",
        description: "Get the authenticated user's recent activity.",
        path: "/log/recent_activity/",
        id_arg: None,
        listing: false,
    },
    Endpoint {
        name: "analytics_sqllab_export_query_results",
        description: "Export a SQL Lab query's results as CSV text. Takes the query's \
                      client id, not its server id.",
        path: "/sqllab/export/{id}",
        id_arg: Some("client_id"),
        listing: false,
    },
    Endpoint {
        name: "analytics_sqllab_get_bootstrap_data",
        description: "Get SQL Lab bootstrap data: open tabs, databases and recent queries.",
        path: "/sqllab/",
        id_arg: None,
        listing: false,
    },
];

pub(super) fn register(registry: &mut ToolRegistry) {
    for endpoint in ENDPOINTS {
        registry.register(Box::new(Passthrough { endpoint }));
    }
}

struct Passthrough {
    endpoint: &'static Endpoint,
}

#[derive(Debug, Default, Deserialize)]
struct ListingArgs {
    #[serde(default)]
    q: Option<String>,
}

impl Passthrough {
    fn path(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let Some(id_arg) = self.endpoint.id_arg else {
            return Ok(self.endpoint.path.to_string());
        };
        let raw = args
            .get(id_arg)
            .cloned()
            .ok_or_else(|| ToolError::invalid_arguments(format!("missing field `{id_arg}`")))?;
        let id: Id = serde_json::from_value(raw)
            .map_err(|e| ToolError::invalid_arguments(format!("{id_arg}: {e}")))?;
        if id.as_str().contains(['/', '?', '#']) {
            return Err(ToolError::invalid_arguments(format!(
                "{id_arg} must not contain path separators"
            )));
        }
        Ok(self.endpoint.path.replace("{id}", id.as_str()))
    }
}

#[async_trait]
impl Tool for Passthrough {
    fn definition(&self) -> ToolDefinition {
        let mut properties = Map::new();
        let mut required = Vec::new();
        if let Some(id_arg) = self.endpoint.id_arg {
            properties.insert(id_arg.to_string(), json!({ "type": ["integer", "string"] }));
            required.push(json!(id_arg));
        }
        if self.endpoint.listing {
            properties.insert(
                "q".to_string(),
                json!({
                    "type": "string",
                    "description": "Rison-encoded filter, sort and paging (optional)"
                }),
            );
        }

        ToolDefinition {
            name: self.endpoint.name.to_string(),
            description: self.endpoint.description.to_string(),
            input_schema: json!({
                "type": "object",
                "properties": properties,
                "required": required,
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        let args: Map<String, Value> = parse_args(args)?;
        let path = self.path(&args)?;

        let query = if self.endpoint.listing {
            let listing: ListingArgs = parse_args(Value::Object(args))?;
            listing.q.map(|q| vec![("q".to_string(), q)])
        } else {
            None
        };

        let response = ctx.gateway.get(&path, query.as_deref()).await?;
        Ok(response.body)
    }
}
