//! Print the `DumpRequest` CustomResourceDefinition as YAML

use dump_controller::DumpRequest;
use kube::CustomResourceExt;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&DumpRequest::crd())?);
    Ok(())
}
