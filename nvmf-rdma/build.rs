//! Build script to generate ibverbs / RDMA-CM bindings using bindgen
//!
//! Only runs with the `rdma` feature.
//! Requires: libibverbs-dev and librdmacm-dev

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    #[cfg(feature = "rdma")]
    rdma::generate();
}

#[cfg(feature = "rdma")]
mod rdma {
    use std::env;
    use std::path::{Path, PathBuf};

    const HEADERS: [&str; 2] = [
        "/usr/include/infiniband/verbs.h",
        "/usr/include/rdma/rdma_cma.h",
    ];

    pub fn generate() {
        println!("cargo:rerun-if-env-changed=NVMF_RDMA_INCLUDE_DIR");
        let include_dir = env::var("NVMF_RDMA_INCLUDE_DIR").ok();

        if include_dir.is_none() {
            for header in HEADERS {
                if !Path::new(header).exists() {
                    panic!(
                        "{} not found; install libibverbs-dev and librdmacm-dev \
                         or build without the `rdma` feature",
                        header
                    );
                }
            }
        }

        println!("cargo:rustc-link-lib=ibverbs");
        println!("cargo:rustc-link-lib=rdmacm");

        let mut builder = bindgen::Builder::default().header_contents(
            "wrapper.h",
            r#"
#include <infiniband/verbs.h>
#include <rdma/rdma_cma.h>
            "#,
        );
        if let Some(dir) = include_dir {
            builder = builder.clang_arg(format!("-I{}", dir));
        }

        let bindings = builder
            // Verbs structures
            .allowlist_type("ibv_context")
            .allowlist_type("ibv_context_ops")
            .allowlist_type("ibv_device_attr")
            .allowlist_type("ibv_pd")
            .allowlist_type("ibv_mr")
            .allowlist_type("ibv_cq")
            .allowlist_type("ibv_qp")
            .allowlist_type("ibv_qp_init_attr")
            .allowlist_type("ibv_send_wr")
            .allowlist_type("ibv_recv_wr")
            .allowlist_type("ibv_sge")
            .allowlist_type("ibv_wc")
            // Verbs functions (the data path goes through ibv_context_ops)
            .allowlist_function("ibv_get_device_name")
            .allowlist_function("ibv_query_device")
            .allowlist_function("ibv_alloc_pd")
            .allowlist_function("ibv_dealloc_pd")
            .allowlist_function("ibv_reg_mr")
            .allowlist_function("ibv_dereg_mr")
            .allowlist_function("ibv_create_cq")
            .allowlist_function("ibv_destroy_cq")
            // RDMA-CM
            .allowlist_type("rdma_cm_id")
            .allowlist_type("rdma_cm_event")
            .allowlist_type("rdma_conn_param")
            .allowlist_type("rdma_event_channel")
            .allowlist_function("rdma_get_devices")
            .allowlist_function("rdma_free_devices")
            .allowlist_function("rdma_create_event_channel")
            .allowlist_function("rdma_destroy_event_channel")
            .allowlist_function("rdma_create_id")
            .allowlist_function("rdma_destroy_id")
            .allowlist_function("rdma_resolve_addr")
            .allowlist_function("rdma_resolve_route")
            .allowlist_function("rdma_create_qp")
            .allowlist_function("rdma_destroy_qp")
            .allowlist_function("rdma_connect")
            .allowlist_function("rdma_disconnect")
            .allowlist_function("rdma_get_cm_event")
            .allowlist_function("rdma_ack_cm_event")
            .allowlist_function("rdma_event_str")
            // Constants and enums
            .allowlist_var("IBV_ACCESS_.*")
            .allowlist_var("IBV_WR_.*")
            .allowlist_var("IBV_WC_.*")
            .allowlist_var("IBV_SEND_.*")
            .allowlist_var("IBV_QPT_.*")
            .allowlist_var("RDMA_PS_.*")
            .allowlist_var("RDMA_CM_EVENT_.*")
            .allowlist_type("ibv_qp_type")
            .allowlist_type("ibv_wr_opcode")
            .allowlist_type("ibv_wc_status")
            .allowlist_type("ibv_wc_opcode")
            .allowlist_type("ibv_access_flags")
            .allowlist_type("ibv_send_flags")
            .allowlist_type("rdma_port_space")
            .allowlist_type("rdma_cm_event_type")
            // Plain constants: IBV_WC_SUCCESS, IBV_QPT_RC, ...
            .default_enum_style(bindgen::EnumVariation::Consts)
            .prepend_enum_name(false)
            .derive_debug(true)
            .derive_default(true)
            .layout_tests(false)
            .parse_callbacks(Box::new(bindgen::CargoCallbacks::new()))
            .generate()
            .expect("Unable to generate RDMA bindings");

        let out_path = PathBuf::from(env::var("OUT_DIR").expect("OUT_DIR not set"));
        bindings
            .write_to_file(out_path.join("rdma_bindings.rs"))
            .expect("Couldn't write bindings");
    }
}
