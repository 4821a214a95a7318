use kube::CustomResourceExt;
use vertica_k8s::crd::VerticaDB;

fn main() -> Result<(), serde_yaml::Error> {
    print!("{}", serde_yaml::to_string(&VerticaDB::crd())?);
    Ok(())
}
