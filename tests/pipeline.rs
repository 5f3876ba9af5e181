//! End-to-end runs through the library API: enumerate → plan → (simulated
//! dump run) → categorize → archive → compare.

mod util;

use std::collections::BTreeSet;
use std::fs;

use dumpsieve::AppContext;
use dumpsieve::core::archive::{ArchiveOptions, ArchiveReader, BlobLayout, generate};
use dumpsieve::core::categorize::{CategorizeOptions, Categorizer, SCRUB_HITS_FILE};
use dumpsieve::core::compare::{CorpusSource, NoiseFilter, build_report};
use dumpsieve::core::diagnostics::PhaseDiagnostics;
use dumpsieve::core::plan::{PlanOptions, build_plan};
use dumpsieve::core::reader::{ReaderOptions, SectionReader};
use dumpsieve::core::scrub::{IdentifierRule, Scrubber};
use dumpsieve::core::undumped::{check, write_makeup};
use dumpsieve::infra::config::PlanConfig;
use dumpsieve::infra::output::is_incomplete;

use util::{dump_log, enumeration_log, write};

fn quiet() -> AppContext
{
    AppContext { quiet: true, no_color: true, ..AppContext::default() }
}

fn enumerations(tmp: &assert_fs::TempDir) -> (std::path::PathBuf, std::path::PathBuf)
{
    let forward = enumeration_log(&[
        (
            "MapA_P",
            &[("Foo", "GD_Foo.Bar_1"), ("Foo", "GD_Foo.Bar_2"), ("Baz", "GD_Baz.Z")],
        ),
        ("MapB_P", &[("Foo", "GD_Foo.Bar_1"), ("Qux", "GD_Qux.Q")]),
    ]);
    let reverse = enumeration_log(&[
        ("MapB_P", &[("Qux", "GD_Qux.Q"), ("Foo", "gd_foo.bar_1")]),
        ("MapA_P", &[("Foo", "GD_Foo.Bar_1"), ("Foo", "GD_Foo.Bar_2")]),
    ]);
    (write(tmp, "forward.log", &forward), write(tmp, "reverse.log", &reverse))
}

#[test]
fn planned_object_round_trips_into_the_archive()
{
    let tmp = assert_fs::TempDir::new().unwrap();
    let ctx = quiet();
    let (forward, reverse) = enumerations(&tmp);

    // Plan
    let plan_dir = tmp
        .path()
        .join("plan");
    let mut diag = PhaseDiagnostics::new("plan");
    let opts = PlanOptions::from_config(&PlanConfig::default()).unwrap();
    let manifest = build_plan(&forward, Some(reverse.as_path()), Some(&plan_dir), opts, &ctx, &mut diag).unwrap();

    let files: Vec<&str> = manifest
        .batches
        .iter()
        .map(|b| b.file.as_str())
        .collect();
    assert_eq!(files, vec!["defaults.000", "MapA_P.000", "MapB_P.000"]);
    assert_eq!(
        fs::read_to_string(plan_dir.join("MapA_P.000")).unwrap(),
        "obj dump GD_Foo.Bar_1\nobj dump GD_Foo.Bar_2\n"
    );
    assert_eq!(fs::read_to_string(plan_dir.join("MapB_P.000")).unwrap(), "obj dump GD_Qux.Q\n");
    assert_eq!(
        fs::read_to_string(plan_dir.join("defaults.000")).unwrap(),
        "obj dump Default__Foo\nobj dump Default__Qux\n"
    );
    assert_eq!(diag.get("already_planned"), 1);
    assert!(!is_incomplete(&plan_dir));

    // Simulated dump run, including a duplicate and a sensitive literal
    let log = dump_log(&[
        (
            "MapA_P",
            &[
                ("Foo", "GD_Foo.Bar_1", &["  Prop=1", "  Password=hunter2"]),
                ("Foo", "GD_Foo.Bar_2", &["  Prop=2"]),
                ("Foo", "GD_Foo.Bar_1", &["  Prop=999"]),
            ],
            &[],
        ),
        ("MapB_P", &[("Qux", "GD_Qux.Q", &["  Q=1"])], &[]),
        (
            "defaults",
            &[
                ("Foo", "Core.Default__Foo", &["  ObjectArchetype=Object'Core.Default__Object'"]),
                ("Qux", "Core.Default__Qux", &[]),
            ],
            &[],
        ),
    ]);
    let log = write(&tmp, "dumps.log", &log);

    // Categorize through a one-file pool
    let corpus = tmp
        .path()
        .join("categorized");
    let scrubber = Scrubber::new(vec![b"hunter2".to_vec()], IdentifierRule::new("UniqueId=", BTreeSet::new())).unwrap();
    let mut categorizer = Categorizer::new(CategorizeOptions {
        out_dir: corpus.clone(),
        max_open_files: 1,
        scrubber,
        known_hits: None,
    })
    .unwrap();
    categorizer
        .consume(SectionReader::open(&log, ReaderOptions::dump_log()).unwrap(), &ctx)
        .unwrap();
    let (summary, diag) = categorizer
        .finish()
        .unwrap();
    assert!(summary.complete);
    assert_eq!(summary.objects_written, 5);
    assert_eq!(summary.duplicates_discarded, 1);
    assert_eq!(diag.get("duplicates_discarded"), 1);

    let foo = fs::read_to_string(corpus.join("Foo.dump")).unwrap();
    assert!(!foo.contains("hunter2"));
    assert!(!foo.contains("Prop=999"));
    assert_eq!(
        fs::read_to_string(corpus.join(SCRUB_HITS_FILE)).unwrap(),
        "GD_Foo.Bar_1\trule-1\n"
    );

    // Archive
    let archive = tmp
        .path()
        .join("archive");
    let mut diag = PhaseDiagnostics::new("archive");
    let opts = ArchiveOptions {
        layout: BlobLayout::PerClass,
        max_blob_bytes: 1024,
        generated_at: Some("2023-01-01T00:00:00+00:00".into()),
    };
    generate(&corpus, &archive, &opts, &mut diag).unwrap();

    let reader = ArchiveReader::open(&archive).unwrap();
    let obj = reader
        .lookup("GD_Foo.Bar_1")
        .unwrap()
        .expect("indexed");
    assert_eq!(obj.class_name, "Foo");
    assert!(obj.is_scrubbed());
    assert_eq!(
        reader
            .read_object(&obj)
            .unwrap(),
        b"*** Property dump for object 'Foo GD_Foo.Bar_1' ***\n  Prop=1\n  Password=<hidden>\n".to_vec()
    );
    let foo_class = reader
        .classes()
        .unwrap()
        .into_iter()
        .find(|c| c.name == "Foo")
        .unwrap();
    assert_eq!(foo_class.parent.as_deref(), Some("Object"));
    assert_eq!(foo_class.num_objects, 3);

    // The archive and the directory it came from hold the same corpus
    let mut diag = PhaseDiagnostics::new("compare");
    let report = build_report(
        &CorpusSource::detect(&corpus).unwrap(),
        &CorpusSource::detect(&archive).unwrap(),
        &NoiseFilter::none(),
        false,
        true,
        &mut diag,
    )
    .unwrap();
    assert_eq!(report.counts.unchanged, 5);
    assert_eq!(report.counts.new + report.counts.missing + report.counts.changed, 0);
    assert!(report
        .results
        .is_empty());
}

#[test]
fn undumped_objects_get_a_makeup_plan()
{
    let tmp = assert_fs::TempDir::new().unwrap();
    let ctx = quiet();
    let (forward, reverse) = enumerations(&tmp);

    let plan_dir = tmp
        .path()
        .join("plan");
    let mut diag = PhaseDiagnostics::new("plan");
    let opts = PlanOptions::from_config(&PlanConfig::default()).unwrap();
    build_plan(&forward, Some(reverse.as_path()), Some(&plan_dir), opts, &ctx, &mut diag).unwrap();

    let log = dump_log(&[
        ("MapA_P", &[("Foo", "GD_Foo.Bar_1", &["  Prop=1"])], &["GD_Foo.Bar_2"]),
        ("MapB_P", &[], &["GD_Qux.Q", "Transient.Thing"]),
    ]);
    let log = write(&tmp, "dumps.log", &log);

    let mut diag = PhaseDiagnostics::new("undumped");
    let report = check(&plan_dir, &log, "Class", &mut diag).unwrap();
    let missing: Vec<&str> = report
        .missing
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert_eq!(missing, vec!["GD_Foo.Bar_2", "GD_Qux.Q"]);
    assert_eq!(report.ignored, 1);

    let makeup = plan_dir.join("makeup");
    write_makeup(&report, &makeup, 800).unwrap();
    assert_eq!(fs::read_to_string(makeup.join("MapA_P.000")).unwrap(), "obj dump GD_Foo.Bar_2\n");
    assert_eq!(fs::read_to_string(makeup.join("MapB_P.000")).unwrap(), "obj dump GD_Qux.Q\n");
}

#[test]
fn unfiltered_plan_skips_the_reverse_pass()
{
    let tmp = assert_fs::TempDir::new().unwrap();
    let ctx = quiet();
    let (forward, _) = enumerations(&tmp);

    let plan_dir = tmp
        .path()
        .join("plan");
    let mut diag = PhaseDiagnostics::new("plan");
    let opts = PlanOptions::from_config(&PlanConfig::default()).unwrap();
    build_plan(&forward, None, Some(&plan_dir), opts, &ctx, &mut diag).unwrap();

    assert_eq!(
        fs::read_to_string(plan_dir.join("MapA_P.000")).unwrap(),
        "obj dump GD_Foo.Bar_1\nobj dump GD_Foo.Bar_2\nobj dump GD_Baz.Z\n"
    );
    assert_eq!(fs::read_to_string(plan_dir.join("MapB_P.000")).unwrap(), "obj dump GD_Qux.Q\n");
    assert_eq!(diag.get("unfiltered"), 1);
    assert_eq!(diag.get("unconfirmed"), 0);
    assert_eq!(diag.get("already_planned"), 1);
}
