//! Checkpoint resolution against synthetic checkpoints on disk

use std::io::Cursor;
use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use inference_engine::{
    Architecture, ClassLabels, InferenceEngine, MobileNetV3, ModelLoader, ModelSource, NUM_CLASSES,
};
use tempfile::TempDir;

/// Save freshly initialized weights of `architecture` as a safetensors state dictionary
fn save_state_dict(dir: &TempDir, architecture: Architecture, num_classes: usize) -> PathBuf {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    MobileNetV3::new(architecture, num_classes, vb).unwrap();

    let path = dir.path().join("best_waste_model.safetensors");
    varmap.save(&path).unwrap();
    path
}

/// Freshly initialized weights of `architecture` named and typed the way
/// `model.state_dict()` exposes them, `num_batches_tracked` counters included
fn torch_state_dict(architecture: Architecture) -> Vec<(String, Tensor)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    MobileNetV3::new(architecture, NUM_CLASSES, vb).unwrap();

    let data = varmap.data().lock().unwrap();
    let mut tensors: Vec<(String, Tensor)> = data
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    let counters: Vec<(String, Tensor)> = tensors
        .iter()
        .filter_map(|(name, _)| name.strip_suffix("running_var"))
        .map(|prefix| {
            let counter = Tensor::new(1200i64, &Device::Cpu).unwrap();
            (format!("{}num_batches_tracked", prefix), counter)
        })
        .collect();
    tensors.extend(counters);
    tensors.sort_by(|a, b| a.0.cmp(&b.0));
    tensors
}

fn sample_jpeg() -> Vec<u8> {
    let img = RgbImage::from_fn(300, 180, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 90]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
        .unwrap();
    bytes
}

#[test]
fn large_state_dict_selects_large_and_skips_small() {
    let dir = TempDir::new().unwrap();
    let path = save_state_dict(&dir, Architecture::MobileNetV3Large, NUM_CLASSES);

    let report = ModelLoader::default().load(&path);

    assert!(report.is_loaded());
    assert_eq!(
        report.source,
        Some(ModelSource::StateDict(Architecture::MobileNetV3Large))
    );
    assert!(report.attempted(ModelSource::FullGraph));
    assert!(!report.attempted(ModelSource::StateDict(Architecture::MobileNetV3Large)));
    assert!(!report.attempted(ModelSource::StateDict(Architecture::MobileNetV3Small)));
}

#[test]
fn small_state_dict_falls_through_to_small() {
    let dir = TempDir::new().unwrap();
    let path = save_state_dict(&dir, Architecture::MobileNetV3Small, NUM_CLASSES);

    let report = ModelLoader::default().load(&path);

    assert_eq!(
        report.source,
        Some(ModelSource::StateDict(Architecture::MobileNetV3Small))
    );
    let large = report
        .attempts
        .iter()
        .find(|a| a.source == ModelSource::StateDict(Architecture::MobileNetV3Large))
        .expect("large attempted first");
    assert!(large.error.contains("MobileNetV3-Large"));
}

#[test]
fn imagenet_head_is_rejected_by_both_candidates() {
    let dir = TempDir::new().unwrap();
    let path = save_state_dict(&dir, Architecture::MobileNetV3Large, 1000);

    let report = ModelLoader::default().load(&path);

    assert!(!report.is_loaded());
    assert_eq!(report.attempts.len(), 3);
    assert!(report.attempts[1].error.contains("size mismatch for classifier.3"));
}

#[test]
fn state_dict_model_predicts_deterministically() {
    let dir = TempDir::new().unwrap();
    let path = save_state_dict(&dir, Architecture::MobileNetV3Small, NUM_CLASSES);
    let report = ModelLoader::default().load(&path);
    let engine = InferenceEngine::from_report(report, ClassLabels::default());

    let bytes = sample_jpeg();
    let first = engine.predict(&bytes).unwrap();
    let second = engine.predict(&bytes).unwrap();

    assert!(first.class_id < NUM_CLASSES);
    assert!((0.0..=1.0).contains(&first.confidence));
    assert_eq!(first.class_id, second.class_id);
    assert_eq!(first.confidence, second.confidence);
}

#[test]
fn full_graph_is_used_directly() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_waste_model.onnx");
    std::fs::write(&path, onnx::tiny_classifier(4)).unwrap();

    let report = ModelLoader::default().load(&path);

    assert_eq!(report.source, Some(ModelSource::FullGraph));
    assert!(report.attempts.is_empty());

    let engine = InferenceEngine::from_report(report, ClassLabels::default());
    let prediction = engine.predict(&sample_jpeg()).unwrap();
    assert_eq!(prediction.class_id, 4);
    assert_eq!(prediction.label, "Clothes");
    assert!(prediction.confidence > 0.99);
}

#[test]
fn missing_checkpoint_leaves_engine_unloaded() {
    let report = ModelLoader::default().load(Path::new("does/not/exist.pth"));
    let engine = InferenceEngine::from_report(report, ClassLabels::default());

    assert!(!engine.is_loaded());
    assert!(engine.predict(&sample_jpeg()).is_err());
}

#[test]
fn pth_state_dict_selects_large() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_waste_model.pth");
    pth::save(&path, &torch_state_dict(Architecture::MobileNetV3Large), None);

    let report = ModelLoader::default().load(&path);

    assert_eq!(
        report.source,
        Some(ModelSource::StateDict(Architecture::MobileNetV3Large))
    );
    assert_eq!(report.attempts.len(), 1);
    assert_eq!(report.attempts[0].source, ModelSource::FullGraph);
}

#[test]
fn pth_weights_nested_under_state_dict_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("best_waste_model.pth");
    let tensors = torch_state_dict(Architecture::MobileNetV3Small);
    pth::save(&path, &tensors, Some("state_dict"));

    let report = ModelLoader::default().load(&path);

    assert_eq!(
        report.source,
        Some(ModelSource::StateDict(Architecture::MobileNetV3Small))
    );
    assert!(report.attempted(ModelSource::StateDict(Architecture::MobileNetV3Large)));

    let engine = InferenceEngine::from_report(report, ClassLabels::default());
    let prediction = engine.predict(&sample_jpeg()).unwrap();
    assert!(prediction.class_id < NUM_CLASSES);
}

#[test]
fn pth_weights_nested_under_model_state_dict_key() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.pth");
    let tensors = torch_state_dict(Architecture::MobileNetV3Small);
    pth::save(&path, &tensors, Some("model_state_dict"));

    let report = ModelLoader::default().load(&path);

    assert_eq!(
        report.source,
        Some(ModelSource::StateDict(Architecture::MobileNetV3Small))
    );
}

/// PyTorch zip checkpoint writer: `archive/data.pkl` holds a protocol 2
/// pickle of an `OrderedDict` whose values rebuild tensors from the raw
/// little-endian storages at `archive/data/<key>`.
mod pth {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    use candle_core::{DType, Tensor};
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    const ARCHIVE: &str = "archive";

    const PROTO: u8 = 0x80;
    const GLOBAL: u8 = b'c';
    const BINUNICODE: u8 = b'X';
    const BININT: u8 = b'J';
    const MARK: u8 = b'(';
    const TUPLE: u8 = b't';
    const EMPTY_TUPLE: u8 = b')';
    const EMPTY_DICT: u8 = b'}';
    const REDUCE: u8 = b'R';
    const BINPERSID: u8 = b'Q';
    const NEWFALSE: u8 = 0x89;
    const SETITEMS: u8 = b'u';
    const STOP: u8 = b'.';

    struct Pickle(Vec<u8>);

    impl Pickle {
        fn new() -> Self {
            Self(vec![PROTO, 2])
        }

        fn op(&mut self, code: u8) {
            self.0.push(code);
        }

        fn global(&mut self, module: &str, name: &str) {
            self.op(GLOBAL);
            self.0.extend_from_slice(format!("{}\n{}\n", module, name).as_bytes());
        }

        fn string(&mut self, value: &str) {
            self.op(BINUNICODE);
            self.0.extend_from_slice(&(value.len() as u32).to_le_bytes());
            self.0.extend_from_slice(value.as_bytes());
        }

        fn int(&mut self, value: usize) {
            self.op(BININT);
            self.0.extend_from_slice(&(value as i32).to_le_bytes());
        }

        fn int_tuple(&mut self, values: &[usize]) {
            self.op(MARK);
            for &value in values {
                self.int(value);
            }
            self.op(TUPLE);
        }

        fn ordered_dict(&mut self) {
            self.global("collections", "OrderedDict");
            self.op(EMPTY_TUPLE);
            self.op(REDUCE);
        }

        /// `_rebuild_tensor_v2(storage, offset, size, stride, requires_grad, hooks)`
        fn tensor(&mut self, storage_key: usize, tensor: &Tensor) {
            let storage = match tensor.dtype() {
                DType::I64 => "LongStorage",
                _ => "FloatStorage",
            };
            let dims = tensor.dims();
            let stride: Vec<usize> = (0..dims.len())
                .map(|i| dims[i + 1..].iter().product())
                .collect();

            self.global("torch._utils", "_rebuild_tensor_v2");
            self.op(MARK);
            self.op(MARK);
            self.string("storage");
            self.global("torch", storage);
            self.string(&storage_key.to_string());
            self.string("cpu");
            self.int(tensor.elem_count());
            self.op(TUPLE);
            self.op(BINPERSID);
            self.int(0);
            self.int_tuple(dims);
            self.int_tuple(&stride);
            self.op(NEWFALSE);
            self.ordered_dict();
            self.op(TUPLE);
            self.op(REDUCE);
        }
    }

    fn storage_bytes(tensor: &Tensor) -> Vec<u8> {
        let flat = tensor.reshape(tensor.elem_count()).unwrap();
        match tensor.dtype() {
            DType::I64 => flat
                .to_vec1::<i64>()
                .unwrap()
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
            _ => flat
                .to_vec1::<f32>()
                .unwrap()
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
        }
    }

    /// Write `tensors` as `torch.save(state_dict)`, or as
    /// `torch.save({"epoch": .., key: state_dict})` when `nest_under` is set.
    pub fn save(path: &Path, tensors: &[(String, Tensor)], nest_under: Option<&str>) {
        let mut pickle = Pickle::new();
        if let Some(key) = nest_under {
            pickle.op(EMPTY_DICT);
            pickle.op(MARK);
            pickle.string("epoch");
            pickle.int(30);
            pickle.string(key);
        }

        pickle.ordered_dict();
        pickle.op(MARK);
        for (storage_key, (name, tensor)) in tensors.iter().enumerate() {
            pickle.string(name);
            pickle.tensor(storage_key, tensor);
        }
        pickle.op(SETITEMS);

        if nest_under.is_some() {
            pickle.op(SETITEMS);
        }
        pickle.op(STOP);

        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        let mut zip = ZipWriter::new(File::create(path).unwrap());

        zip.start_file(format!("{}/data.pkl", ARCHIVE), options).unwrap();
        zip.write_all(&pickle.0).unwrap();

        for (storage_key, (_, tensor)) in tensors.iter().enumerate() {
            zip.start_file(format!("{}/data/{}", ARCHIVE, storage_key), options)
                .unwrap();
            zip.write_all(&storage_bytes(tensor)).unwrap();
        }

        zip.start_file(format!("{}/version", ARCHIVE), options).unwrap();
        zip.write_all(b"3\n").unwrap();
        zip.finish().unwrap();
    }
}

/// GlobalAveragePool -> Flatten -> MatMul -> Add, yielding 12 logits where
/// the bias makes one class dominate.
mod onnx {
    use prost::Message;
    use tract_onnx::pb::tensor_proto::DataType;
    use tract_onnx::pb::tensor_shape_proto::{dimension, Dimension};
    use tract_onnx::pb::type_proto::{self, Value};
    use tract_onnx::pb::{
        GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto,
        TypeProto, ValueInfoProto,
    };

    fn value_info(name: &str, dims: Option<&[i64]>) -> ValueInfoProto {
        let shape = dims.map(|dims| TensorShapeProto {
            dim: dims
                .iter()
                .map(|&d| Dimension {
                    value: Some(dimension::Value::DimValue(d)),
                    ..Default::default()
                })
                .collect(),
        });

        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(Value::TensorType(type_proto::Tensor {
                    elem_type: DataType::Float as i32,
                    shape,
                })),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn initializer(name: &str, dims: &[i64], values: &[f32]) -> TensorProto {
        TensorProto {
            name: name.to_string(),
            dims: dims.to_vec(),
            data_type: DataType::Float as i32,
            raw_data: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
            ..Default::default()
        }
    }

    fn node(op_type: &str, inputs: &[&str], output: &str) -> NodeProto {
        NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            name: output.to_string(),
            op_type: op_type.to_string(),
            ..Default::default()
        }
    }

    pub fn tiny_classifier(winner: usize) -> Vec<u8> {
        let classes = super::NUM_CLASSES;
        let weight: Vec<f32> = (0..3 * classes).map(|i| (i % 5) as f32 * 0.01).collect();
        let mut bias = vec![0.0f32; classes];
        bias[winner] = 100.0;

        let graph = GraphProto {
            name: "tiny-waste-classifier".to_string(),
            node: vec![
                node("GlobalAveragePool", &["input"], "pooled"),
                node("Flatten", &["pooled"], "flat"),
                node("MatMul", &["flat", "weight"], "scores"),
                node("Add", &["scores", "bias"], "logits"),
            ],
            initializer: vec![
                initializer("weight", &[3, classes as i64], &weight),
                initializer("bias", &[classes as i64], &bias),
            ],
            input: vec![value_info("input", Some(&[1, 3, 224, 224][..]))],
            output: vec![value_info("logits", None)],
            ..Default::default()
        };

        ModelProto {
            ir_version: 8,
            producer_name: "checkpoint-loading-test".to_string(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            graph: Some(graph),
            ..Default::default()
        }
        .encode_to_vec()
    }
}
