use tonic_build::manual::{Builder, Method, Service};

const CODEC: &str = "tonic::codec::ProstCodec";

fn method(name: &str, route_name: &str, input_type: &str, output_type: &str) -> Method {
    Method::builder()
        .name(name)
        .route_name(route_name)
        .input_type(&format!("crate::proto::{input_type}"))
        .output_type(&format!("crate::proto::{output_type}"))
        .codec_path(CODEC)
        .build()
}

fn main() {
    let driver = Service::builder()
        .name("Driver")
        .package("flotilla")
        .method(method("ping", "Ping", "Empty", "Empty"))
        .method(method("submit", "Submit", "ApplicationSpec", "ApplicationId"))
        .method(method(
            "get_applications",
            "GetApplications",
            "ApplicationsRequest",
            "ApplicationsResponse",
        ))
        .method(method(
            "application_report",
            "ApplicationReport",
            "ApplicationId",
            "ApplicationReport",
        ))
        .method(method(
            "kill_application",
            "KillApplication",
            "ApplicationId",
            "Empty",
        ))
        .build();

    let master = Service::builder()
        .name("Master")
        .package("flotilla")
        .method(method(
            "get_specification",
            "GetSpecification",
            "Empty",
            "ApplicationSpec",
        ))
        .method(method("scale", "Scale", "ScaleRequest", "ContainerList"))
        .method(method("kill_container", "KillContainer", "ContainerId", "Empty"))
        .method(method(
            "get_containers",
            "GetContainers",
            "ContainersRequest",
            "ContainerList",
        ))
        .method(method("shutdown", "Shutdown", "ShutdownRequest", "Empty"))
        .method(method("key_value_get", "KeyValueGet", "KeyRequest", "ValueResponse"))
        .method(method("key_value_set", "KeyValueSet", "SetRequest", "Empty"))
        .method(method("key_value_delete", "KeyValueDelete", "KeyRequest", "Empty"))
        .method(method("key_value_wait", "KeyValueWait", "KeyRequest", "ValueResponse"))
        .method(method("key_value_get_all", "KeyValueGetAll", "Empty", "KeyValueMap"))
        .build();

    Builder::new().compile(&[driver, master]);
}
