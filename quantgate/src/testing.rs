//! Hand-built fixtures for tests: tiny in-memory ONNX graphs and image
//! files. Everything here panics on failure.

use std::path::Path;

use prost_tract_compat::Message;
use tract_onnx::pb;

fn dim_value(v: i64) -> pb::tensor_shape_proto::Dimension {
    pb::tensor_shape_proto::Dimension {
        value: Some(pb::tensor_shape_proto::dimension::Value::DimValue(v)),
        ..Default::default()
    }
}

fn dim_param(p: &str) -> pb::tensor_shape_proto::Dimension {
    pb::tensor_shape_proto::Dimension {
        value: Some(pb::tensor_shape_proto::dimension::Value::DimParam(p.into())),
        ..Default::default()
    }
}

fn float_info(name: &str, dims: Vec<pb::tensor_shape_proto::Dimension>) -> pb::ValueInfoProto {
    pb::ValueInfoProto {
        name: name.into(),
        r#type: Some(pb::TypeProto {
            value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                elem_type: pb::tensor_proto::DataType::Float as i32,
                shape: Some(pb::TensorShapeProto { dim: dims }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn node(op: &str, inputs: &[&str], outputs: &[&str]) -> pb::NodeProto {
    pb::NodeProto {
        input: inputs.iter().map(|s| s.to_string()).collect(),
        output: outputs.iter().map(|s| s.to_string()).collect(),
        op_type: op.into(),
        ..Default::default()
    }
}

fn encode(graph: pb::GraphProto) -> Vec<u8> {
    pb::ModelProto {
        ir_version: 8,
        opset_import: vec![pb::OperatorSetIdProto {
            domain: String::new(),
            version: 13,
        }],
        producer_name: "quantgate-tests".into(),
        graph: Some(graph),
        ..Default::default()
    }
    .encode_to_vec()
}

fn image_dims(h: usize, w: usize) -> Vec<pb::tensor_shape_proto::Dimension> {
    vec![
        dim_value(1),
        dim_value(3),
        dim_value(h as i64),
        dim_value(w as i64),
    ]
}

/// `input [1,3,h,w] -> Relu -> act`, `input -> Neg -> neg`. Two declared
/// outputs with well-known behavior.
pub fn two_output_model(h: usize, w: usize) -> Vec<u8> {
    encode(pb::GraphProto {
        node: vec![
            node("Relu", &["input"], &["act"]),
            node("Neg", &["input"], &["neg"]),
        ],
        name: "two_outputs".into(),
        input: vec![float_info("input", image_dims(h, w))],
        output: vec![
            float_info("act", image_dims(h, w)),
            float_info("neg", image_dims(h, w)),
        ],
        ..Default::default()
    })
}

/// `input [1,4] + bias [4] -> sum`, with `bias` declared both as graph
/// input and initializer the way exporters commonly do.
pub fn biased_add_model() -> Vec<u8> {
    encode(pb::GraphProto {
        node: vec![node("Add", &["input", "bias"], &["sum"])],
        name: "biased_add".into(),
        initializer: vec![pb::TensorProto {
            dims: vec![4],
            data_type: pb::tensor_proto::DataType::Float as i32,
            float_data: vec![0.5, -0.5, 1.0, 0.0],
            name: "bias".into(),
            ..Default::default()
        }],
        input: vec![
            float_info("input", vec![dim_value(1), dim_value(4)]),
            float_info("bias", vec![dim_value(4)]),
        ],
        output: vec![float_info("sum", vec![dim_value(1), dim_value(4)])],
        ..Default::default()
    })
}

/// Like a single-output relu graph, but with a symbolic batch dimension
/// `N` that canonicalization has to pin down.
pub fn symbolic_batch_model(h: usize, w: usize) -> Vec<u8> {
    let dims = || {
        vec![
            dim_param("N"),
            dim_value(3),
            dim_value(h as i64),
            dim_value(w as i64),
        ]
    };
    encode(pb::GraphProto {
        node: vec![node("Relu", &["input"], &["act"])],
        name: "symbolic_batch".into(),
        input: vec![float_info("input", dims())],
        output: vec![float_info("act", dims())],
        ..Default::default()
    })
}

/// Write a single-color RGB image, all three channels at `tint`.
pub fn write_solid_image(path: &Path, w: u32, h: u32, tint: u8) {
    image::RgbImage::from_pixel(w, h, image::Rgb([tint, tint, tint]))
        .save(path)
        .unwrap();
}

/// Write an RGB image from explicit pixels, row major.
pub fn write_pixels(path: &Path, w: u32, h: u32, pixels: &[[u8; 3]]) {
    assert_eq!(pixels.len(), (w * h) as usize);
    let mut img = image::RgbImage::new(w, h);
    for (i, px) in pixels.iter().enumerate() {
        let x = i as u32 % w;
        let y = i as u32 / w;
        img.put_pixel(x, y, image::Rgb(*px));
    }
    img.save(path).unwrap();
}
