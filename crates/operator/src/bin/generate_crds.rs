use jobbatch_operator::startup::all_crds;

fn main() -> anyhow::Result<()> {
    for crd in all_crds() {
        println!("---");
        println!("# {} CRD", crd.spec.names.kind);
        print!("{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
