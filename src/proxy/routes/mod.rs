mod admin_routes;

pub(crate) use admin_routes::admin_router;
