use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Vertex layout must match flex_render::Vertex:
    //   - binding 0, location 0: R32G32B32_SFLOAT (position)
    //   - binding 0, location 1: R32G32B32_SFLOAT (uvw)
    // The mesh transform arrives as a 64-byte push constant.
    let vs_src = r#"
#version 450
layout(location = 0) in vec3 inPos;
layout(location = 1) in vec3 inUvw;

layout(push_constant) uniform Push { mat4 transform; } pc;

layout(location = 0) out vec3 vUvw;

void main() {
    vUvw = inUvw;
    gl_Position = pc.transform * vec4(inPos, 1.0);
}
"#;

    // Shader 0: uvw as colour.
    let fs_color_src = r#"
#version 450
layout(location = 0) in vec3 vUvw;
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(vUvw, 1.0);
}
"#;

    // Shader 1: grey by depth, nearer is brighter.
    let fs_depth_src = r#"
#version 450
layout(location = 0) in vec3 vUvw;
layout(location = 0) out vec4 outColor;

void main() {
    float d = 1.0 - gl_FragCoord.z;
    outColor = vec4(vec3(d), 1.0);
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_0 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let shaders = [
        (vs_src, shaderc::ShaderKind::Vertex, "mesh.vert"),
        (fs_color_src, shaderc::ShaderKind::Fragment, "color.frag"),
        (fs_depth_src, shaderc::ShaderKind::Fragment, "depth.frag"),
    ];
    for (src, kind, name) in shaders {
        let spv = comp
            .compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap_or_else(|e| panic!("{name}: {e}"));
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).unwrap();
    }

    println!("cargo:rerun-if-changed=build.rs");
}
